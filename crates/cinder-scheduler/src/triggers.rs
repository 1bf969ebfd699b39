//! Trigger matching and evaluation.

use chrono::{DateTime, Duration, Utc};
use cinder_core::ConfigError;
use cinder_core::glob::glob_match;
use cinder_core::ports::ScheduleClock;
use cinder_core::trigger::{RunRequest, TriggerEvent};
use cinder_core::workflow::{EnvMap, InputSpec, TriggerSpec, WorkflowDefinition};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of one trigger spec against one event.
#[derive(Debug, Clone)]
pub enum TriggerDecision {
    Start(RunRequest),
    Rejected { trigger_index: usize, reason: String },
    NotMatched { trigger_index: usize },
}

/// Decides which runs an event starts. Stateless apart from the clock it reads.
pub struct TriggerEvaluator<'a> {
    clock: &'a dyn ScheduleClock,
}

impl<'a> TriggerEvaluator<'a> {
    pub fn new(clock: &'a dyn ScheduleClock) -> Self {
        Self { clock }
    }

    /// Run requests for every trigger spec the event satisfies.
    pub fn evaluate(&self, workflow: &WorkflowDefinition, event: &TriggerEvent) -> Vec<RunRequest> {
        self.evaluate_detailed(workflow, event)
            .into_iter()
            .filter_map(|decision| match decision {
                TriggerDecision::Start(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// One decision per trigger spec, in declaration order.
    pub fn evaluate_detailed(
        &self,
        workflow: &WorkflowDefinition,
        event: &TriggerEvent,
    ) -> Vec<TriggerDecision> {
        workflow
            .triggers
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let decision = self.evaluate_one(workflow, index, spec, event);
                match &decision {
                    TriggerDecision::Start(_) => {
                        info!(workflow = %workflow.name, trigger = index, kind = %event.kind, "Trigger matched")
                    }
                    TriggerDecision::Rejected { reason, .. } => {
                        warn!(workflow = %workflow.name, trigger = index, %reason, "Trigger rejected")
                    }
                    TriggerDecision::NotMatched { .. } => {
                        debug!(workflow = %workflow.name, trigger = index, "Trigger did not match")
                    }
                }
                decision
            })
            .collect()
    }

    fn evaluate_one(
        &self,
        workflow: &WorkflowDefinition,
        index: usize,
        spec: &TriggerSpec,
        event: &TriggerEvent,
    ) -> TriggerDecision {
        let not_matched = TriggerDecision::NotMatched { trigger_index: index };
        if spec.kind() != event.kind {
            return not_matched;
        }

        let start = |inputs: EnvMap| {
            TriggerDecision::Start(RunRequest {
                workflow: workflow.name.clone(),
                trigger_index: index,
                event: event.clone(),
                inputs,
            })
        };

        match spec {
            TriggerSpec::Push {
                branches,
                branches_ignore,
                tags,
                paths,
                paths_ignore,
            } => {
                let ref_matches = match (event.tag(), event.branch()) {
                    (Some(tag), _) => tag_matches(tags, tag),
                    (None, Some(branch)) => {
                        branch_matches(branches, branch)
                            && !branches_ignore.iter().any(|p| glob_match(p, branch))
                    }
                    (None, None) => false,
                };
                if ref_matches && changed_paths_match(paths, paths_ignore, event) {
                    start(EnvMap::new())
                } else {
                    not_matched
                }
            }
            TriggerSpec::PullRequest {
                branches,
                paths,
                paths_ignore,
            } => {
                let target = event
                    .payload
                    .get("base_ref")
                    .and_then(|v| v.as_str())
                    .map(|r| r.strip_prefix("refs/heads/").unwrap_or(r))
                    .or_else(|| event.branch());
                let branch_ok = target.is_some_and(|t| branch_matches(branches, t));
                if branch_ok && changed_paths_match(paths, paths_ignore, event) {
                    start(EnvMap::new())
                } else {
                    not_matched
                }
            }
            TriggerSpec::Schedule { cron } => {
                if let Some(named) = event.payload.get("cron").and_then(|v| v.as_str())
                    && named != cron
                {
                    return not_matched;
                }
                match self.schedule_due(&workflow.name, cron) {
                    Ok(true) => start(EnvMap::new()),
                    Ok(false) => not_matched,
                    Err(reason) => TriggerDecision::Rejected {
                        trigger_index: index,
                        reason,
                    },
                }
            }
            TriggerSpec::Manual { inputs } | TriggerSpec::WorkflowCall { inputs } => {
                match resolve_inputs(inputs, event.inputs()) {
                    Ok(resolved) => start(resolved),
                    Err(reason) => TriggerDecision::Rejected {
                        trigger_index: index,
                        reason,
                    },
                }
            }
        }
    }

    fn schedule_due(&self, workflow: &str, expression: &str) -> Result<bool, String> {
        let schedule = parse_cron(expression)?;
        let now = self.clock.now();
        let last = self
            .clock
            .last_fired(workflow, expression)
            .unwrap_or_else(|| now - Duration::seconds(60));
        Ok(schedule.after(&last).next().is_some_and(|next| next <= now))
    }
}

/// Parse a 5-field (minute precision) or 6/7-field cron expression.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, String> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| format!("invalid cron '{expression}': {e}"))
}

/// Reject trigger specs that can never match: bad cron expressions and input
/// defaults outside their declared options.
pub fn validate_triggers(workflow: &WorkflowDefinition) -> Result<(), ConfigError> {
    for (index, spec) in workflow.triggers.iter().enumerate() {
        match spec {
            TriggerSpec::Schedule { cron } => {
                parse_cron(cron).map_err(|reason| ConfigError::InvalidTrigger { index, reason })?;
            }
            TriggerSpec::Manual { inputs } | TriggerSpec::WorkflowCall { inputs } => {
                for (name, input) in inputs {
                    if let Some(default) = &input.default
                        && !input.options.is_empty()
                        && !input.options.contains(default)
                    {
                        return Err(ConfigError::InvalidTrigger {
                            index,
                            reason: format!("default '{default}' of input '{name}' is not an allowed option"),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Apply declared defaults and check required inputs and allowed options.
fn resolve_inputs(declared: &IndexMap<String, InputSpec>, provided: EnvMap) -> Result<EnvMap, String> {
    if let Some(unknown) = provided.keys().find(|k| !declared.contains_key(*k)) {
        return Err(format!("unexpected input '{unknown}'"));
    }

    let mut resolved = EnvMap::new();
    for (name, spec) in declared {
        let value = provided.get(name).cloned().or_else(|| spec.default.clone());
        match value {
            Some(value) => {
                if !spec.options.is_empty() && !spec.options.contains(&value) {
                    return Err(format!(
                        "input '{name}' must be one of [{}], got '{value}'",
                        spec.options.join(", ")
                    ));
                }
                resolved.insert(name.clone(), value);
            }
            None if spec.required => return Err(format!("missing required input '{name}'")),
            None => {}
        }
    }
    Ok(resolved)
}

fn branch_matches(patterns: &[String], branch: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|p| glob_match(p, branch))
}

fn tag_matches(patterns: &[String], tag: &str) -> bool {
    // Tags only match when explicitly listed.
    patterns.iter().any(|p| glob_match(p, tag))
}

fn changed_paths_match(include: &[String], exclude: &[String], event: &TriggerEvent) -> bool {
    match event.changed_paths() {
        Some(changed) => paths_match(include, exclude, &changed),
        None => true,
    }
}

fn paths_match(include: &[String], exclude: &[String], changed: &[String]) -> bool {
    if include.is_empty() && exclude.is_empty() {
        return true;
    }

    let included = include.is_empty()
        || changed
            .iter()
            .any(|path| include.iter().any(|p| glob_match(p, path)));

    let excluded = !exclude.is_empty()
        && changed
            .iter()
            .all(|path| exclude.iter().any(|p| glob_match(p, path)));

    included && !excluded
}

/// Wall clock with an in-memory record of when each schedule last fired.
#[derive(Default)]
pub struct SystemClock {
    fired: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fired(&self, workflow: &str, cron: &str, at: DateTime<Utc>) {
        let mut fired = self.fired.lock().unwrap_or_else(|e| e.into_inner());
        fired.insert((workflow.to_string(), cron.to_string()), at);
    }
}

impl ScheduleClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn last_fired(&self, workflow: &str, cron: &str) -> Option<DateTime<Utc>> {
        let fired = self.fired.lock().unwrap_or_else(|e| e.into_inner());
        fired.get(&(workflow.to_string(), cron.to_string())).copied()
    }
}
