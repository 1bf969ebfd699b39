//! Port traits.
//!
//! These traits define the seams between the engine and its external collaborators:
//! the execution sandbox, secret storage, cache and artifact storage, run persistence
//! and the wall clock used for schedules.

use crate::cache::{Artifact, ArtifactUpload, CacheEntry, CacheHit};
use crate::ids::{InstanceId, RunId};
use crate::run::RunRecord;
use crate::secrets::SecretScope;
use crate::workflow::EnvMap;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

/// What a step asks the sandbox to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCommand {
    Script { shell: String, script: String },
    Action { reference: String, with: EnvMap },
}

/// A fully resolved step ready for execution.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub run_id: RunId,
    pub instance: InstanceId,
    pub step: String,
    pub command: StepCommand,
    /// Merged environment, secrets included.
    pub env: EnvMap,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    /// Receives each output line as it is produced. Lines are unmasked.
    pub output: Option<mpsc::Sender<OutputLine>>,
}

impl Drop for StepInvocation {
    fn drop(&mut self) {
        for value in self.env.values_mut() {
            value.zeroize();
        }
    }
}

/// A line of step output, as streamed to observers.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub instance: InstanceId,
    pub step: String,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Result reported by the sandbox for one step.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub outputs: EnvMap,
    /// Combined stdout and stderr, unmasked.
    pub log: String,
    pub timed_out: bool,
}

impl StepOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Execution sandbox.
///
/// `execute` returns `Err` only for infrastructure problems; a failing command is an
/// `Ok` outcome with a non-zero exit code.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Runner name for logs.
    fn name(&self) -> &str;

    /// Run one step. The runner must stop the step when `cancel` fires.
    async fn execute(
        &self,
        invocation: &StepInvocation,
        cancel: CancellationToken,
    ) -> Result<StepOutcome>;

    /// Pack the given workspace paths into an archive.
    async fn collect_files(&self, paths: &[String], dir: &Path) -> Result<Vec<u8>>;

    /// Unpack an archive produced by `collect_files` into `dir`.
    async fn restore_files(&self, archive: &[u8], dir: &Path) -> Result<()>;
}

/// Secret storage.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Look up a secret, failing with `Error::SecretNotFound` when absent.
    async fn resolve(&self, scope: &SecretScope, name: &str) -> Result<String>;
}

/// Keyed build cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Exact key first, then the longest restore prefix that matches any entry; the most
    /// recently written entry wins within that prefix. A miss is `Ok(None)`.
    async fn get(&self, key: &str, restore_prefixes: &[String]) -> Result<Option<CacheHit>>;

    /// Store a blob under `key`, replacing any previous entry.
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<CacheEntry>;

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<CacheEntry>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// An artifact together with its archive bytes.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub artifact: Artifact,
    pub blob: Vec<u8>,
}

/// Per-run artifact storage.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Publish an artifact. Fails with `Error::ArtifactConflict` if the name is taken in this run.
    async fn put(&self, run_id: RunId, upload: ArtifactUpload) -> Result<Artifact>;

    async fn get(&self, run_id: RunId, name: &str) -> Result<Option<StoredArtifact>>;

    async fn list(&self, run_id: RunId) -> Result<Vec<Artifact>>;

    /// Drop artifacts past their retention deadline, returning what was removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Artifact>>;
}

/// Durable run records.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn save(&self, record: &RunRecord) -> Result<()>;

    async fn get(&self, id: RunId) -> Result<Option<RunRecord>>;

    /// All stored runs, newest first.
    async fn list(&self) -> Result<Vec<RunRecord>>;
}

/// Time source for schedule triggers.
pub trait ScheduleClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// When the schedule last fired, if ever.
    fn last_fired(&self, workflow: &str, cron: &str) -> Option<DateTime<Utc>>;
}
