//! Instance-level dependency graph and workflow validation.

use crate::matrix::MatrixExpander;
use cinder_core::ConfigError;
use cinder_core::expr::{Condition, ExprContext, ExprError};
use cinder_core::ids::InstanceId;
use cinder_core::interpolation;
use cinder_core::run::JobState;
use cinder_core::workflow::{JobTemplate, MatrixAssignment, WorkflowDefinition};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// A node in the dependency graph: one job instance.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: InstanceId,
    pub template: String,
    pub assignment: MatrixAssignment,
    pub condition: Condition,
    /// Instances this one waits for, in `needs` order.
    pub needs: Vec<InstanceId>,
}

/// Directed acyclic graph of job instances. Edges point from a dependency to its dependent.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<GraphNode, ()>,
    index: HashMap<InstanceId, NodeIndex>,
    /// Instance ids in template declaration order, then matrix order.
    order: Vec<InstanceId>,
}

impl DependencyGraph {
    /// Validate a workflow and expand it into instances.
    pub fn build(workflow: &WorkflowDefinition) -> Result<Self, ConfigError> {
        if workflow.jobs.is_empty() {
            return Err(ConfigError::EmptyWorkflow);
        }

        let mut names = HashSet::new();
        for job in &workflow.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
        }

        for job in &workflow.jobs {
            for need in &job.needs {
                if !names.contains(need.as_str()) {
                    return Err(ConfigError::UnknownJob {
                        job: need.clone(),
                        needed_by: job.name.clone(),
                    });
                }
            }
        }

        detect_cycle(workflow)?;
        validate_expressions(workflow)?;

        let expander = MatrixExpander::new();
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut order = Vec::new();
        let mut by_template: HashMap<&str, Vec<InstanceId>> = HashMap::new();

        for job in &workflow.jobs {
            let condition = Condition::parse(job.condition.as_deref()).map_err(|source| {
                ConfigError::InvalidExpression {
                    location: format!("jobs.{}.if", job.name),
                    source,
                }
            })?;

            for instance in expander.expand(job)? {
                if index.contains_key(&instance.id) {
                    return Err(ConfigError::DuplicateInstance(instance.id.to_string()));
                }
                by_template
                    .entry(job.name.as_str())
                    .or_default()
                    .push(instance.id.clone());
                let node = GraphNode {
                    id: instance.id.clone(),
                    template: job.name.clone(),
                    assignment: instance.assignment,
                    condition: condition.clone(),
                    needs: Vec::new(),
                };
                index.insert(instance.id.clone(), graph.add_node(node));
                order.push(instance.id);
            }
        }

        for job in &workflow.jobs {
            let needs: Vec<InstanceId> = job
                .needs
                .iter()
                .flat_map(|need| by_template.get(need.as_str()).cloned().unwrap_or_default())
                .collect();

            for id in by_template.get(job.name.as_str()).into_iter().flatten() {
                let node_idx = index[id];
                for dep in &needs {
                    graph.add_edge(index[dep], node_idx, ());
                }
                graph[node_idx].needs = needs.clone();
            }
        }

        let dag = Self {
            graph,
            index,
            order,
        };
        dag.check_artifact_names(workflow)?;
        Ok(dag)
    }

    fn check_artifact_names(&self, workflow: &WorkflowDefinition) -> Result<(), ConfigError> {
        let mut producers: HashMap<String, InstanceId> = HashMap::new();
        for node in self.nodes() {
            let Some(job) = workflow.job(&node.template) else {
                continue;
            };
            let ctx = static_context(workflow, &node.assignment);
            for artifact in &job.artifacts {
                let name = interpolation::interpolate(&artifact.name, &ctx).map_err(|source| {
                    ConfigError::InvalidExpression {
                        location: format!("jobs.{}.artifacts.{}", job.name, artifact.name),
                        source,
                    }
                })?;
                if let Some(first) = producers.get(&name) {
                    return Err(ConfigError::DuplicateArtifact {
                        name,
                        first: first.to_string(),
                        second: node.id.to_string(),
                    });
                }
                producers.insert(name, node.id.clone());
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn node(&self, id: &InstanceId) -> Option<&GraphNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.order.iter().map(|id| &self.graph[self.index[id]])
    }

    /// Instances the given instance waits for.
    pub fn dependencies(&self, id: &InstanceId) -> Vec<&InstanceId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Instances waiting for the given instance.
    pub fn dependents(&self, id: &InstanceId) -> Vec<&InstanceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &InstanceId, direction: Direction) -> Vec<&InstanceId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<&InstanceId> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| &self.graph[n].id)
            .collect();
        // petgraph yields neighbors newest edge first.
        ids.sort_by_key(|id| self.position(id));
        ids.dedup();
        ids
    }

    fn position(&self, id: &InstanceId) -> usize {
        self.index.get(id).map_or(usize::MAX, |idx| idx.index())
    }

    /// Instances not yet completed whose dependencies all succeeded.
    pub fn ready(&self, completed: &HashMap<InstanceId, JobState>) -> Vec<InstanceId> {
        self.nodes()
            .filter(|node| !completed.contains_key(&node.id))
            .filter(|node| {
                node.needs
                    .iter()
                    .all(|dep| completed.get(dep) == Some(&JobState::Succeeded))
            })
            .map(|node| node.id.clone())
            .collect()
    }

    /// Successive `ready` sets assuming every instance succeeds.
    pub fn waves(&self) -> Vec<Vec<InstanceId>> {
        let mut completed = HashMap::new();
        let mut waves = Vec::new();
        loop {
            let wave = self.ready(&completed);
            if wave.is_empty() {
                break;
            }
            for id in &wave {
                completed.insert(id.clone(), JobState::Succeeded);
            }
            waves.push(wave);
        }
        waves
    }

    /// Instances ordered so every dependency precedes its dependents.
    pub fn topological_order(&self) -> Vec<InstanceId> {
        self.waves().into_iter().flatten().collect()
    }
}

/// Depth-first search over templates in declaration order with an explicit recursion stack.
fn detect_cycle(workflow: &WorkflowDefinition) -> Result<(), ConfigError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        jobs: &HashMap<&'a str, &'a JobTemplate>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), ConfigError> {
        marks.insert(name, Mark::OnStack);
        stack.push(name);

        if let Some(&job) = jobs.get(name) {
            for need in &job.needs {
                match marks.get(need.as_str()).copied().unwrap_or(Mark::Unvisited) {
                    Mark::OnStack => {
                        let start = stack.iter().position(|n| *n == need).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|n| n.to_string()).collect();
                        cycle.push(need.clone());
                        return Err(ConfigError::CyclicDependency { cycle });
                    }
                    Mark::Unvisited => visit(need, jobs, marks, stack)?,
                    Mark::Done => {}
                }
            }
        }

        stack.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let jobs: HashMap<&str, &JobTemplate> =
        workflow.jobs.iter().map(|j| (j.name.as_str(), j)).collect();
    let mut marks = HashMap::new();
    let mut stack = Vec::new();

    for job in &workflow.jobs {
        if marks.get(job.name.as_str()).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
            visit(&job.name, &jobs, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

/// Parse every condition and template in the workflow.
fn validate_expressions(workflow: &WorkflowDefinition) -> Result<(), ConfigError> {
    let check = |location: String, result: Result<(), ExprError>| {
        result.map_err(|source| ConfigError::InvalidExpression { location, source })
    };
    let condition = |source: &Option<String>| Condition::parse(source.as_deref()).map(|_| ());

    for (key, value) in &workflow.env {
        check(format!("env.{key}"), interpolation::validate(value))?;
    }

    for job in &workflow.jobs {
        let prefix = format!("jobs.{}", job.name);
        check(format!("{prefix}.if"), condition(&job.condition))?;
        for (key, value) in &job.env {
            check(format!("{prefix}.env.{key}"), interpolation::validate(value))?;
        }
        for (key, value) in &job.outputs {
            check(format!("{prefix}.outputs.{key}"), interpolation::validate(value))?;
        }
        if let Some(concurrency) = &job.concurrency {
            check(
                format!("{prefix}.concurrency.group"),
                interpolation::validate(&concurrency.group),
            )?;
        }
        for cache in &job.cache {
            check(format!("{prefix}.cache.key"), interpolation::validate(&cache.key))?;
            for restore in &cache.restore_keys {
                check(format!("{prefix}.cache.restore_keys"), interpolation::validate(restore))?;
            }
        }
        for artifact in &job.artifacts {
            check(
                format!("{prefix}.artifacts.{}.if", artifact.name),
                condition(&artifact.condition),
            )?;
        }
        for step in &job.steps {
            let step_prefix = format!("{prefix}.steps.{}", step.name);
            check(format!("{step_prefix}.if"), condition(&step.condition))?;
            for (key, value) in &step.env {
                check(format!("{step_prefix}.env.{key}"), interpolation::validate(value))?;
            }
        }
    }
    Ok(())
}

/// Context with only the values known before a run starts.
fn static_context(workflow: &WorkflowDefinition, assignment: &MatrixAssignment) -> ExprContext {
    ExprContext {
        env: workflow.env.clone(),
        matrix: assignment.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn workflow(jobs: serde_json::Value) -> WorkflowDefinition {
        serde_json::from_value(json!({ "name": "ci", "jobs": jobs })).unwrap()
    }

    fn job(name: &str, needs: &[&str]) -> serde_json::Value {
        json!({
            "name": name,
            "needs": needs,
            "steps": [{ "name": "run", "run": "true" }]
        })
    }

    fn ids(list: &[InstanceId]) -> Vec<&str> {
        list.iter().map(InstanceId::as_str).collect()
    }

    #[test]
    fn test_linear_graph() {
        let dag = DependencyGraph::build(&workflow(json!([
            job("build", &[]),
            job("test", &["build"]),
            job("deploy", &["test"]),
        ])))
        .unwrap();

        assert_eq!(dag.len(), 3);
        assert_eq!(ids(&dag.topological_order()), vec!["build", "test", "deploy"]);
        assert_eq!(ids(&dag.ready(&HashMap::new())), vec!["build"]);
    }

    #[test]
    fn test_matrix_instances_fan_in() {
        let mut test = job("test", &["lint"]);
        test["matrix"] = json!({ "axes": { "node": [16, 18] } });
        let dag = DependencyGraph::build(&workflow(json!([
            job("lint", &[]),
            test,
            job("build", &["test"]),
        ])))
        .unwrap();

        let build = InstanceId::new("build");
        assert_eq!(
            dag.dependencies(&build).into_iter().map(InstanceId::as_str).collect::<Vec<_>>(),
            vec!["test#16", "test#18"]
        );
        assert_eq!(
            dag.dependents(&InstanceId::new("lint"))
                .into_iter()
                .map(InstanceId::as_str)
                .collect::<Vec<_>>(),
            vec!["test#16", "test#18"]
        );

        let waves: Vec<Vec<String>> = dag
            .waves()
            .into_iter()
            .map(|w| w.into_iter().map(|id| id.to_string()).collect())
            .collect();
        assert_eq!(
            waves,
            vec![vec!["lint".to_string()], vec!["test#16".into(), "test#18".into()], vec![
                "build".into()
            ]]
        );
    }

    #[test]
    fn test_ready_requires_succeeded_dependencies() {
        let dag = DependencyGraph::build(&workflow(json!([
            job("a", &[]),
            job("b", &["a"]),
        ])))
        .unwrap();

        let mut completed = HashMap::new();
        completed.insert(InstanceId::new("a"), JobState::Failed);
        assert!(dag.ready(&completed).is_empty());

        completed.insert(InstanceId::new("a"), JobState::Succeeded);
        assert_eq!(ids(&dag.ready(&completed)), vec!["b"]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let err = DependencyGraph::build(&workflow(json!([
            job("a", &["b"]),
            job("b", &["a"]),
        ])))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::CyclicDependency {
                cycle: vec!["a".into(), "b".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_self_loop() {
        let err = DependencyGraph::build(&workflow(json!([job("a", &["a"])]))).unwrap_err();
        assert_eq!(
            err,
            ConfigError::CyclicDependency {
                cycle: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(
            DependencyGraph::build(&workflow(json!([]))).unwrap_err(),
            ConfigError::EmptyWorkflow
        );
        assert_eq!(
            DependencyGraph::build(&workflow(json!([job("a", &[]), job("a", &[])]))).unwrap_err(),
            ConfigError::DuplicateJob("a".into())
        );
        assert_eq!(
            DependencyGraph::build(&workflow(json!([job("a", &["ghost"])]))).unwrap_err(),
            ConfigError::UnknownJob {
                job: "ghost".into(),
                needed_by: "a".into()
            }
        );
    }

    #[test]
    fn test_instance_id_clash_across_jobs() {
        let mut matrix = job("t", &[]);
        matrix["matrix"] = json!({ "axes": { "v": ["a"] } });
        let err = DependencyGraph::build(&workflow(json!([job("t#a", &[]), matrix]))).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateInstance("t#a".into()));
    }

    #[test]
    fn test_invalid_condition() {
        let mut bad = job("a", &[]);
        bad["if"] = json!("matrix.os ==");
        let err = DependencyGraph::build(&workflow(json!([bad]))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidExpression { ref location, .. } if location == "jobs.a.if"));
    }

    #[test]
    fn test_duplicate_artifact_after_interpolation() {
        let mut build = job("build", &[]);
        build["matrix"] = json!({ "axes": { "os": ["linux", "macos"] } });
        build["artifacts"] = json!([{ "name": "dist", "paths": ["dist/"] }]);
        let err = DependencyGraph::build(&workflow(json!([build.clone()]))).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateArtifact {
                name: "dist".into(),
                first: "build#linux".into(),
                second: "build#macos".into(),
            }
        );

        build["artifacts"] = json!([{ "name": "dist-${{ matrix.os }}", "paths": ["dist/"] }]);
        assert!(DependencyGraph::build(&workflow(json!([build]))).is_ok());
    }
}
