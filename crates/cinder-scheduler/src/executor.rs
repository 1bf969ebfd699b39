//! Executes one dispatched job instance: secrets, downloads, cache restore, steps,
//! outputs, cache save and artifact upload, strictly in that order.

use crate::context::RunContext;
use crate::retry::{RetryPolicy, with_backoff};
use chrono::{DateTime, Utc};
use cinder_core::cache::ArtifactUpload;
use cinder_core::expr::{Condition, ExprContext, NeedsEntry, StatusView, StepEntry};
use cinder_core::ids::{InstanceId, RunId};
use cinder_core::interpolation::{interpolate, interpolate_map};
use cinder_core::ports::{
    ArtifactStore, CacheStore, OutputLine, StepCommand, StepInvocation, StepRunner,
};
use cinder_core::run::{CacheReport, FailureReason, JobState, StepRecord, StepState};
use cinder_core::secrets::SecretScope;
use cinder_core::workflow::{EnvMap, JobTemplate, MatrixAssignment, StepAction, StepSpec};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Secret name and value pairs injected into step environments.
type SecretEnv = Vec<(String, Zeroizing<String>)>;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Parent directory of per-instance workspaces, or the shared workspace itself.
    pub workspace_root: PathBuf,
    /// Give every instance its own directory under `workspace_root`.
    pub isolate_workspaces: bool,
    /// Keep isolated workspaces after the job ends.
    pub keep_workspaces: bool,
    pub retry: RetryPolicy,
    /// Recorded step logs are cut to this many bytes.
    pub max_log_bytes: usize,
    pub default_step_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("cinder"),
            isolate_workspaces: true,
            keep_workspaces: false,
            retry: RetryPolicy::default(),
            max_log_bytes: 1024 * 1024,
            default_step_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Snapshot of everything a worker needs about its instance.
#[derive(Debug, Clone)]
pub struct JobAssignment {
    pub instance: InstanceId,
    pub template: String,
    pub matrix: MatrixAssignment,
    /// Upstream results keyed by template name.
    pub needs: IndexMap<String, NeedsEntry>,
    /// Instances whose artifacts may be downloaded (succeeded producers).
    pub succeeded: HashSet<InstanceId>,
    pub cancel: CancellationToken,
}

/// What a worker reports back to the scheduler.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub state: JobState,
    pub steps: Vec<StepRecord>,
    pub outputs: EnvMap,
    pub artifacts: Vec<String>,
    pub caches: Vec<CacheReport>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl JobOutcome {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            state: JobState::Running,
            steps: Vec::new(),
            outputs: EnvMap::new(),
            artifacts: Vec::new(),
            caches: Vec::new(),
            error: None,
            started_at: now,
            completed_at: now,
        }
    }

    /// An outcome for an instance that never reached its steps.
    pub fn failed(error: impl Into<String>) -> Self {
        let mut outcome = Self::new();
        outcome.error = Some(error.into());
        outcome.finish(JobState::Failed)
    }

    fn finish(mut self, state: JobState) -> Self {
        self.state = state;
        self.completed_at = Utc::now();
        self
    }
}

pub struct StepExecutor {
    runner: Arc<dyn StepRunner>,
    cache: Option<Arc<dyn CacheStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    observer: Option<mpsc::Sender<OutputLine>>,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(runner: Arc<dyn StepRunner>, config: ExecutorConfig) -> Self {
        Self {
            runner,
            cache: None,
            artifacts: None,
            observer: None,
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Stream step output to `tx` as it is produced, with secrets masked.
    pub fn with_observer(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute(&self, ctx: &RunContext, job: JobAssignment) -> JobOutcome {
        let mut outcome = JobOutcome::new();

        let Some(template) = ctx.workflow.job(&job.template) else {
            outcome.error = Some(format!("unknown job template '{}'", job.template));
            return outcome.finish(JobState::Failed);
        };

        info!(run_id = %ctx.run_id, instance = %job.instance, runner = self.runner.name(), "Job started");

        let workspace = match self.prepare_workspace(ctx.run_id, &job.instance).await {
            Ok(dir) => dir,
            Err(e) => {
                outcome.error = Some(format!("workspace setup failed: {e}"));
                return outcome.finish(JobState::Failed);
            }
        };

        let state = self
            .run_job(ctx, &job, template, &workspace, &mut outcome)
            .await;
        self.cleanup_workspace(&workspace).await;

        info!(
            run_id = %ctx.run_id,
            instance = %job.instance,
            state = state.as_str(),
            "Job finished"
        );
        outcome.finish(state)
    }

    async fn run_job(
        &self,
        ctx: &RunContext,
        job: &JobAssignment,
        template: &JobTemplate,
        workspace: &Path,
        out: &mut JobOutcome,
    ) -> JobState {
        let mut expr = ctx.expr_context();
        expr.matrix = job.matrix.clone();
        expr.needs = job.needs.clone();
        expr.job.insert("name".into(), template.name.clone());
        expr.job.insert("id".into(), job.instance.to_string());
        expr.job.insert("workspace".into(), workspace.display().to_string());

        match self.resolve_env(ctx, template, &expr) {
            Ok(env) => expr.env = env,
            Err(reason) => {
                out.error = Some(reason);
                return JobState::Failed;
            }
        }

        let secret_env = self.resolve_secrets(ctx, job, template).await;

        for name in &template.download {
            if let Err(reason) = self.download(ctx.run_id, name, job, workspace).await {
                warn!(run_id = %ctx.run_id, instance = %job.instance, %reason, "Artifact download failed");
                out.error = Some(reason);
                return JobState::Failed;
            }
        }

        out.caches = self.restore_caches(ctx, job, template, &expr, workspace).await;

        let (failed, cancelled) = self
            .run_steps(ctx, job, template, &mut expr, &secret_env, workspace, out)
            .await;

        let state = if cancelled {
            JobState::Cancelled
        } else if failed {
            JobState::Failed
        } else {
            JobState::Succeeded
        };

        if !cancelled {
            for (name, value) in &template.outputs {
                match interpolate(value, &expr) {
                    Ok(v) => {
                        out.outputs.insert(name.clone(), ctx.mask(&v).await);
                    }
                    Err(e) => warn!(instance = %job.instance, output = %name, error = %e, "Output not computed"),
                }
            }
        }

        if state == JobState::Succeeded {
            self.save_caches(job, template, workspace, &mut out.caches).await;
        }

        expr.status = StatusView {
            failed: state == JobState::Failed,
            cancelled,
        };
        out.artifacts = self
            .upload_artifacts(ctx.run_id, job, template, &expr, workspace)
            .await;

        state
    }

    fn resolve_env(
        &self,
        ctx: &RunContext,
        template: &JobTemplate,
        expr: &ExprContext,
    ) -> Result<EnvMap, String> {
        let mut env = interpolate_map(&ctx.workflow.env, expr)
            .map_err(|e| format!("workflow env: {e}"))?;
        let layered = ExprContext {
            env: env.clone(),
            ..expr.clone()
        };
        let job_env = interpolate_map(&template.env, &layered)
            .map_err(|e| format!("job env: {e}"))?;
        env.extend(job_env);
        Ok(env)
    }

    async fn resolve_secrets(
        &self,
        ctx: &RunContext,
        job: &JobAssignment,
        template: &JobTemplate,
    ) -> SecretEnv {
        let scopes = SecretScope::lookup_order(template.environment.as_deref());
        let mut env = SecretEnv::new();
        for name in &template.secrets {
            match ctx.secret(&scopes, name).await {
                Some(value) => env.push((name.clone(), value)),
                None => warn!(
                    run_id = %ctx.run_id,
                    instance = %job.instance,
                    secret = %name,
                    "Secret not found, omitting"
                ),
            }
        }
        env
    }

    async fn download(
        &self,
        run_id: RunId,
        name: &str,
        job: &JobAssignment,
        workspace: &Path,
    ) -> Result<(), String> {
        let store = self
            .artifacts
            .as_ref()
            .ok_or_else(|| format!("artifact '{name}' not found: no artifact store configured"))?;

        let stored = with_backoff(&self.config.retry, "artifact download", |_| {
            store.get(run_id, name)
        })
        .await
        .map_err(|e| format!("artifact '{name}' download failed: {e}"))?;

        let stored = match stored {
            Some(s) if job.succeeded.contains(&s.artifact.producer) => s,
            _ => return Err(format!("artifact '{name}' not found")),
        };

        let runner = &self.runner;
        with_backoff(&self.config.retry, "artifact restore", |_| {
            runner.restore_files(&stored.blob, workspace)
        })
        .await
        .map_err(|e| format!("artifact '{name}' could not be unpacked: {e}"))?;

        debug!(instance = %job.instance, artifact = name, "Artifact downloaded");
        Ok(())
    }

    async fn restore_caches(
        &self,
        ctx: &RunContext,
        job: &JobAssignment,
        template: &JobTemplate,
        expr: &ExprContext,
        workspace: &Path,
    ) -> Vec<CacheReport> {
        let mut reports = Vec::new();
        for spec in &template.cache {
            let key = interpolate(&spec.key, expr).unwrap_or_else(|_| spec.key.clone());
            let prefixes: Vec<String> = spec
                .restore_keys
                .iter()
                .map(|p| interpolate(p, expr).unwrap_or_else(|_| p.clone()))
                .collect();

            let mut report = CacheReport {
                key: key.clone(),
                matched_key: None,
                exact_match: false,
                saved: false,
            };

            if let Some(store) = &self.cache {
                let lookup = with_backoff(&self.config.retry, "cache restore", |_| {
                    store.get(&key, &prefixes)
                })
                .await;

                match lookup {
                    Ok(Some(hit)) => match self.runner.restore_files(&hit.blob, workspace).await {
                        Ok(()) => {
                            info!(
                                run_id = %ctx.run_id,
                                instance = %job.instance,
                                key = %key,
                                matched = %hit.entry.key,
                                exact = hit.exact,
                                "Cache restored"
                            );
                            report.matched_key = Some(hit.entry.key);
                            report.exact_match = hit.exact;
                        }
                        Err(e) => {
                            warn!(instance = %job.instance, key = %key, error = %e, "Cache unpack failed, treating as miss")
                        }
                    },
                    Ok(None) => debug!(instance = %job.instance, key = %key, "Cache miss"),
                    Err(e) => {
                        warn!(instance = %job.instance, key = %key, error = %e, "Cache unavailable, treating as miss")
                    }
                }
            }
            reports.push(report);
        }
        reports
    }

    /// Returns `(failed, cancelled)`.
    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        ctx: &RunContext,
        job: &JobAssignment,
        template: &JobTemplate,
        expr: &mut ExprContext,
        secret_env: &[(String, Zeroizing<String>)],
        workspace: &Path,
        out: &mut JobOutcome,
    ) -> (bool, bool) {
        let budget = template
            .timeout_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60));
        let deadline = budget.map(|b| Instant::now() + b);
        let mut failed = false;

        for (index, step) in template.steps.iter().enumerate() {
            if job.cancel.is_cancelled() {
                cancel_remaining(&template.steps[index..], out);
                return (failed, true);
            }

            expr.status = StatusView {
                failed,
                cancelled: false,
            };

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let record = self
                .run_step(ctx, job, step, expr, secret_env, workspace, remaining)
                .await;

            if record.state == StepState::Failed && !step.continue_on_error {
                failed = true;
                if matches!(record.failure, Some(FailureReason::Timeout { .. }))
                    && remaining.is_some_and(|r| r.is_zero())
                    && let Some(b) = budget
                {
                    out.error = Some(format!("job exceeded its {} minute timeout", b.as_secs() / 60));
                }
            }

            expr.steps.insert(
                step.name.clone(),
                StepEntry {
                    outcome: record.state.as_str().to_string(),
                    outputs: record.outputs.clone(),
                },
            );

            let was_cancelled = record.state == StepState::Cancelled;
            out.steps.push(record);
            if was_cancelled {
                cancel_remaining(&template.steps[index + 1..], out);
                return (failed, true);
            }
        }

        (failed, false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        ctx: &RunContext,
        job: &JobAssignment,
        step: &StepSpec,
        expr: &ExprContext,
        secret_env: &[(String, Zeroizing<String>)],
        workspace: &Path,
        remaining: Option<Duration>,
    ) -> StepRecord {
        let mut record = StepRecord::pending(&step.name);

        let condition = match Condition::parse(step.condition.as_deref()) {
            Ok(c) => c,
            Err(e) => {
                record.failure = Some(FailureReason::Infrastructure {
                    message: format!("invalid condition: {e}"),
                });
                return record.finish(StepState::Failed);
            }
        };
        if !condition.evaluate(expr) {
            debug!(instance = %job.instance, step = %step.name, "Step skipped");
            return record.finish(StepState::Skipped);
        }

        let step_timeout = step
            .timeout_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
            .unwrap_or(self.config.default_step_timeout);
        let timeout = remaining.map_or(step_timeout, |r| r.min(step_timeout));

        record.started_at = Some(chrono::Utc::now());

        if timeout.is_zero() {
            record.failure = Some(FailureReason::Timeout { after_secs: 0 });
            return record.finish(StepState::Failed);
        }

        let mut invocation = match self.invocation(ctx, job, step, expr, secret_env, workspace, timeout) {
            Ok(inv) => inv,
            Err(message) => {
                record.failure = Some(FailureReason::Infrastructure { message });
                return record.finish(StepState::Failed);
            }
        };

        info!(run_id = %ctx.run_id, instance = %job.instance, step = %step.name, "Step started");

        let runner = &self.runner;
        let cancel = &job.cancel;
        let result = match &self.observer {
            Some(observer) => {
                let (tx, rx) = mpsc::channel(256);
                invocation.output = Some(tx);
                let inv = &invocation;
                let done = CancellationToken::new();
                let execute = async {
                    let result = with_backoff(&self.config.retry, "step", move |_| {
                        runner.execute(inv, cancel.clone())
                    })
                    .await;
                    done.cancel();
                    result
                };
                let (result, ()) = tokio::join!(execute, stream_masked(ctx, rx, observer, &done));
                result
            }
            None => {
                let inv = &invocation;
                with_backoff(&self.config.retry, "step", move |_| {
                    runner.execute(inv, cancel.clone())
                })
                .await
            }
        };
        drop(invocation);

        let state = match result {
            Err(e) => {
                warn!(instance = %job.instance, step = %step.name, error = %e, "Step runner failed");
                record.failure = Some(FailureReason::Infrastructure {
                    message: ctx.mask(&e.to_string()).await,
                });
                if job.cancel.is_cancelled() {
                    StepState::Cancelled
                } else {
                    StepState::Failed
                }
            }
            Ok(outcome) => {
                record.exit_code = Some(outcome.exit_code);
                record.log = truncate_log(&ctx.mask(&outcome.log).await, self.config.max_log_bytes);
                record.outputs = ctx.mask_map(&outcome.outputs).await;

                if job.cancel.is_cancelled() && !outcome.success() {
                    StepState::Cancelled
                } else if outcome.timed_out {
                    record.failure = Some(FailureReason::Timeout {
                        after_secs: timeout.as_secs(),
                    });
                    StepState::Failed
                } else if outcome.exit_code != 0 {
                    record.failure = Some(FailureReason::ExitCode {
                        code: outcome.exit_code,
                    });
                    StepState::Failed
                } else {
                    StepState::Succeeded
                }
            }
        };

        info!(
            run_id = %ctx.run_id,
            instance = %job.instance,
            step = %step.name,
            state = state.as_str(),
            exit_code = record.exit_code,
            "Step finished"
        );
        record.finish(state)
    }

    #[allow(clippy::too_many_arguments)]
    fn invocation(
        &self,
        ctx: &RunContext,
        job: &JobAssignment,
        step: &StepSpec,
        expr: &ExprContext,
        secret_env: &[(String, Zeroizing<String>)],
        workspace: &Path,
        timeout: Duration,
    ) -> Result<StepInvocation, String> {
        let mut env = expr.env.clone();
        env.extend(interpolate_map(&step.env, expr).map_err(|e| format!("step env: {e}"))?);
        env.insert("CI".into(), "true".into());
        env.insert("CINDER_RUN_ID".into(), ctx.run_id.to_string());
        env.insert("CINDER_JOB".into(), job.instance.to_string());
        env.insert("CINDER_WORKSPACE".into(), workspace.display().to_string());
        env.extend(secret_env.iter().map(|(k, v)| (k.clone(), v.to_string())));

        let command = match &step.action {
            StepAction::Run { run, shell } => StepCommand::Script {
                shell: shell.clone(),
                script: interpolate(run, expr).map_err(|e| format!("script: {e}"))?,
            },
            StepAction::Uses { uses, with } => StepCommand::Action {
                reference: uses.clone(),
                with: interpolate_map(with, expr).map_err(|e| format!("with: {e}"))?,
            },
        };

        let working_dir = match &step.working_directory {
            Some(dir) => workspace.join(interpolate(dir, expr).map_err(|e| format!("working_directory: {e}"))?),
            None => workspace.to_path_buf(),
        };

        Ok(StepInvocation {
            run_id: ctx.run_id,
            instance: job.instance.clone(),
            step: step.name.clone(),
            command,
            env,
            working_dir,
            timeout,
            output: None,
        })
    }

    async fn save_caches(
        &self,
        job: &JobAssignment,
        template: &JobTemplate,
        workspace: &Path,
        reports: &mut [CacheReport],
    ) {
        let Some(store) = &self.cache else {
            return;
        };

        for (spec, report) in template.cache.iter().zip(reports.iter_mut()) {
            if !spec.save || report.exact_match {
                continue;
            }

            let runner = &self.runner;
            let paths = &spec.paths;
            let blob = match with_backoff(&self.config.retry, "cache collect", |_| {
                runner.collect_files(paths, workspace)
            })
            .await
            {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(instance = %job.instance, key = %report.key, error = %e, "Cache paths not collected");
                    continue;
                }
            };

            let key = report.key.clone();
            match with_backoff(&self.config.retry, "cache save", |_| store.put(&key, blob.clone())).await {
                Ok(entry) => {
                    info!(instance = %job.instance, key = %key, size = entry.size_bytes, "Cache saved");
                    report.saved = true;
                }
                Err(e) => warn!(instance = %job.instance, key = %key, error = %e, "Cache save failed"),
            }
        }
    }

    async fn upload_artifacts(
        &self,
        run_id: RunId,
        job: &JobAssignment,
        template: &JobTemplate,
        expr: &ExprContext,
        workspace: &Path,
    ) -> Vec<String> {
        let mut uploaded = Vec::new();
        let Some(store) = &self.artifacts else {
            return uploaded;
        };

        for spec in &template.artifacts {
            let wanted = Condition::parse(spec.condition.as_deref())
                .map(|c| c.evaluate(expr))
                .unwrap_or(false);
            if !wanted {
                continue;
            }

            let name = match interpolate(&spec.name, expr) {
                Ok(name) => name,
                Err(e) => {
                    warn!(instance = %job.instance, artifact = %spec.name, error = %e, "Artifact name not rendered");
                    continue;
                }
            };
            let paths: Vec<String> = spec
                .paths
                .iter()
                .map(|p| interpolate(p, expr).unwrap_or_else(|_| p.clone()))
                .collect();

            let runner = &self.runner;
            let blob = match with_backoff(&self.config.retry, "artifact collect", |_| {
                runner.collect_files(&paths, workspace)
            })
            .await
            {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(instance = %job.instance, artifact = %name, error = %e, "Artifact paths not collected");
                    continue;
                }
            };

            let upload = ArtifactUpload {
                name: name.clone(),
                producer: job.instance.clone(),
                paths,
                retention_days: spec.retention_days,
                blob,
            };
            match with_backoff(&self.config.retry, "artifact upload", |_| {
                store.put(run_id, upload.clone())
            })
            .await
            {
                Ok(artifact) => {
                    info!(instance = %job.instance, artifact = %name, size = artifact.size_bytes, "Artifact uploaded");
                    uploaded.push(name);
                }
                Err(e) => warn!(instance = %job.instance, artifact = %name, error = %e, "Artifact upload failed"),
            }
        }
        uploaded
    }

    async fn prepare_workspace(&self, run_id: RunId, instance: &InstanceId) -> std::io::Result<PathBuf> {
        let dir = if self.config.isolate_workspaces {
            self.config
                .workspace_root
                .join(run_id.to_string())
                .join(workspace_dir_name(instance.as_str()))
        } else {
            self.config.workspace_root.clone()
        };
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn cleanup_workspace(&self, dir: &Path) {
        if !self.config.isolate_workspaces || self.config.keep_workspaces {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            debug!(path = %dir.display(), error = %e, "Workspace not removed");
        }
    }
}

fn cancel_remaining(steps: &[StepSpec], out: &mut JobOutcome) {
    out.steps.extend(
        steps
            .iter()
            .map(|s| StepRecord::pending(&s.name).finish(StepState::Cancelled)),
    );
}

/// Forward runner output to `observer` with secrets masked, until `done` fires and the
/// channel is drained.
async fn stream_masked(
    ctx: &RunContext,
    mut rx: mpsc::Receiver<OutputLine>,
    observer: &mpsc::Sender<OutputLine>,
    done: &CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            line = rx.recv() => line,
            _ = done.cancelled() => break,
        };
        let Some(mut line) = line else {
            return;
        };
        line.content = ctx.mask(&line.content).await;
        // A closed observer does not stop the step.
        let _ = observer.send(line).await;
    }
    while let Ok(mut line) = rx.try_recv() {
        line.content = ctx.mask(&line.content).await;
        let _ = observer.send(line).await;
    }
}

/// Cut a log to at most `max` bytes on a character boundary.
pub fn truncate_log(log: &str, max: usize) -> String {
    if log.len() <= max {
        return log.to_string();
    }
    let mut end = max;
    while end > 0 && !log.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[log truncated: {} bytes omitted]", &log[..end], log.len() - end)
}

/// Filesystem-safe directory name for an instance, unique per instance id.
fn workspace_dir_name(name: &str) -> String {
    let readable: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Sha256::digest(name.as_bytes());
    format!("{readable}-{}", hex::encode(&digest[..4]))
}
