//! Matrix expansion for parallel job generation.

use cinder_core::ConfigError;
use cinder_core::ids::InstanceId;
use cinder_core::workflow::{JobTemplate, MatrixAssignment, MatrixSpec};
use indexmap::IndexMap;
use std::collections::HashSet;

/// One instance of an expanded job template.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixInstance {
    pub id: InstanceId,
    pub assignment: MatrixAssignment,
}

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a job template into its instances, in deterministic order.
    ///
    /// Without a matrix the template yields exactly one instance named after the job.
    pub fn expand(&self, template: &JobTemplate) -> Result<Vec<MatrixInstance>, ConfigError> {
        let Some(matrix) = template.matrix.as_ref() else {
            return Ok(vec![MatrixInstance {
                id: InstanceId::for_template(&template.name, None),
                assignment: MatrixAssignment::new(),
            }]);
        };

        self.validate(&template.name, matrix)?;

        let mut combinations = self.generate_combinations(&matrix.axes);

        // Excludes apply to the product only; unspecified keys are wildcards.
        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| self.matches_exclude(combo, exclude))
        });

        for include in &matrix.include {
            if !combinations.contains(include) {
                combinations.push(include.clone());
            }
        }

        let bases: Vec<String> = combinations.iter().map(|a| self.suffix(a)).collect();
        let mut taken: HashSet<String> = bases.iter().cloned().collect();
        let mut first_use: HashSet<&str> = HashSet::new();
        let mut instances = Vec::with_capacity(combinations.len());
        for (assignment, base) in combinations.into_iter().zip(&bases) {
            let suffix = if first_use.insert(base.as_str()) {
                base.clone()
            } else {
                // A generated suffix must not shadow a natural one, e.g. a value `a~2`.
                let mut n = 2;
                while taken.contains(&format!("{base}~{n}")) {
                    n += 1;
                }
                let suffix = format!("{base}~{n}");
                taken.insert(suffix.clone());
                suffix
            };
            instances.push(MatrixInstance {
                id: InstanceId::for_template(&template.name, Some(&suffix)),
                assignment,
            });
        }

        Ok(instances)
    }

    fn validate(&self, job: &str, matrix: &MatrixSpec) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidMatrix {
            job: job.to_string(),
            reason,
        };

        if matrix.axes.is_empty() && matrix.include.is_empty() {
            return Err(invalid("matrix declares no axes and no includes".to_string()));
        }
        if let Some((axis, _)) = matrix.axes.iter().find(|(_, values)| values.is_empty()) {
            return Err(invalid(format!("axis '{axis}' has no values")));
        }
        for exclude in &matrix.exclude {
            if exclude.is_empty() {
                return Err(invalid("exclude entry is empty".to_string()));
            }
            if let Some(key) = exclude.keys().find(|k| !matrix.axes.contains_key(*k)) {
                return Err(invalid(format!("exclude names undeclared axis '{key}'")));
            }
        }
        Ok(())
    }

    /// Cartesian product over the axes in declaration order.
    fn generate_combinations(
        &self,
        axes: &IndexMap<String, Vec<serde_json::Value>>,
    ) -> Vec<MatrixAssignment> {
        if axes.is_empty() {
            return Vec::new();
        }

        let mut result = vec![MatrixAssignment::new()];

        for (key, values) in axes {
            let mut next = Vec::with_capacity(result.len() * values.len());

            for combo in result {
                for value in values {
                    let mut new_combo = combo.clone();
                    new_combo.insert(key.clone(), value.clone());
                    next.push(new_combo);
                }
            }

            result = next;
        }

        result
    }

    fn matches_exclude(&self, combo: &MatrixAssignment, exclude: &MatrixAssignment) -> bool {
        exclude
            .iter()
            .all(|(key, value)| combo.get(key) == Some(value))
    }

    fn suffix(&self, assignment: &MatrixAssignment) -> String {
        assignment
            .values()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}
