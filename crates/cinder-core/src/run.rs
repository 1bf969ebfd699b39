//! Run and execution types.
//!
//! [`RunRecord`] is the engine's durable output: every job instance with its state,
//! timestamps, masked step results and produced artifacts.

use crate::ids::{InstanceId, RunId};
use crate::workflow::{EnvMap, MatrixAssignment, TriggerKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub workflow: String,
    pub trigger: TriggerKind,
    pub git_ref: String,
    pub status: RunStatus,
    pub jobs: Vec<JobInstance>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl RunRecord {
    pub fn job(&self, id: &str) -> Option<&JobInstance> {
        self.jobs.iter().find(|job| job.id.as_str() == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// A job template bound to one matrix assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: InstanceId,
    pub template: String,
    pub matrix: MatrixAssignment,
    pub needs: Vec<InstanceId>,
    pub state: JobState,
    pub outputs: EnvMap,
    pub artifacts: Vec<String>,
    pub caches: Vec<CacheReport>,
    pub steps: Vec<StepRecord>,
    /// Reason the instance ended without running its steps to completion.
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobInstance {
    pub fn new(
        id: InstanceId,
        template: impl Into<String>,
        matrix: MatrixAssignment,
        needs: Vec<InstanceId>,
    ) -> Self {
        Self {
            id,
            template: template.into(),
            matrix,
            needs,
            state: JobState::Pending,
            outputs: EnvMap::new(),
            artifacts: Vec::new(),
            caches: Vec::new(),
            steps: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Cancelled
        )
    }

    /// Name used for `needs.<job>.result` in expressions.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Blocked => "blocked",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Succeeded => "success",
            JobState::Failed => "failure",
            JobState::Skipped => "skipped",
            JobState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub state: StepState,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    /// Masked, truncated log.
    pub log: String,
    pub outputs: EnvMap,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StepState::Pending,
            exit_code: None,
            failure: None,
            log: String::new(),
            outputs: EnvMap::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn finish(mut self, state: StepState) -> Self {
        self.state = state;
        self.completed_at = Some(Utc::now());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Skipped | StepState::Cancelled
        )
    }

    /// Name used for `steps.<name>.outcome` in expressions.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Succeeded => "success",
            StepState::Failed => "failure",
            StepState::Skipped => "skipped",
            StepState::Cancelled => "cancelled",
        }
    }
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    ExitCode { code: i32 },
    Timeout { after_secs: u64 },
    Infrastructure { message: String },
}

/// Outcome of one cache request of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheReport {
    pub key: String,
    pub matched_key: Option<String>,
    pub exact_match: bool,
    pub saved: bool,
}
