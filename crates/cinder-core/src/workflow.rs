//! Workflow definition types.
//!
//! A [`WorkflowDefinition`] is the fully resolved, validated model the engine consumes.
//! It is immutable once loaded; every run works from a shared reference to it.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Ordered string map used for environment variables and similar settings.
pub type EnvMap = IndexMap<String, String>;

/// One concrete matrix combination, in axis declaration order.
pub type MatrixAssignment = IndexMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub env: EnvMap,
    pub jobs: Vec<JobTemplate>,
    /// Whole-run budget; the run is cancelled once it elapses.
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

impl WorkflowDefinition {
    pub fn job(&self, name: &str) -> Option<&JobTemplate> {
        self.jobs.iter().find(|job| job.name == name)
    }
}

/// Event filter attached to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum TriggerSpec {
    Push {
        #[serde(default)]
        branches: Vec<String>,
        #[serde(default)]
        branches_ignore: Vec<String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        paths: Vec<String>,
        #[serde(default)]
        paths_ignore: Vec<String>,
    },
    PullRequest {
        #[serde(default)]
        branches: Vec<String>,
        #[serde(default)]
        paths: Vec<String>,
        #[serde(default)]
        paths_ignore: Vec<String>,
    },
    Schedule {
        cron: String,
    },
    Manual {
        #[serde(default)]
        inputs: IndexMap<String, InputSpec>,
    },
    WorkflowCall {
        #[serde(default)]
        inputs: IndexMap<String, InputSpec>,
    },
}

impl TriggerSpec {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerSpec::Push { .. } => TriggerKind::Push,
            TriggerSpec::PullRequest { .. } => TriggerKind::PullRequest,
            TriggerSpec::Schedule { .. } => TriggerKind::Schedule,
            TriggerSpec::Manual { .. } => TriggerKind::Manual,
            TriggerSpec::WorkflowCall { .. } => TriggerKind::WorkflowCall,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Schedule,
    Manual,
    WorkflowCall,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Schedule => "schedule",
            TriggerKind::Manual => "manual",
            TriggerKind::WorkflowCall => "workflow_call",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(TriggerKind::Push),
            "pull_request" => Ok(TriggerKind::PullRequest),
            "schedule" => Ok(TriggerKind::Schedule),
            "manual" => Ok(TriggerKind::Manual),
            "workflow_call" => Ok(TriggerKind::WorkflowCall),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// Declared input of a manual or workflow-call trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct InputSpec {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// Allowed values; empty means any value.
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(rename = "if", default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
    /// Deployment environment; also selects the secret scope.
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencySpec>,
    #[serde(default)]
    pub env: EnvMap,
    /// Secret names exposed to every step as environment variables.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub cache: Vec<CacheSpec>,
    /// Artifacts from upstream jobs to place in the workspace before the first step.
    #[serde(default)]
    pub download: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    /// Job output name to template, e.g. `${{ steps.build.outputs.version }}`.
    #[serde(default)]
    pub outputs: EnvMap,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    /// A failure of this job does not fail the run.
    #[serde(default)]
    pub continue_on_error: bool,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixSpec {
    pub axes: IndexMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub include: Vec<MatrixAssignment>,
    #[serde(default)]
    pub exclude: Vec<MatrixAssignment>,
    /// Upper bound on concurrently running instances of this job.
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencySpec {
    pub group: String,
    #[serde(default)]
    pub cancel_in_progress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepSpec {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(rename = "if", default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub env: EnvMap,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StepAction {
    Run {
        run: String,
        #[serde(default = "default_shell")]
        shell: String,
    },
    Uses {
        uses: String,
        #[serde(default)]
        with: EnvMap,
    },
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Cache restored before the first step and saved after the last.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheSpec {
    pub key: String,
    #[serde(default)]
    pub restore_keys: Vec<String>,
    pub paths: Vec<String>,
    #[serde(default = "default_true")]
    pub save: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactSpec {
    pub name: String,
    pub paths: Vec<String>,
    #[serde(default = "default_retention")]
    pub retention_days: u32,
    /// Upload condition evaluated against the final job status; defaults to `success()`.
    #[serde(rename = "if", default)]
    pub condition: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_retention() -> u32 {
    30
}
