//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use cinder_cache::{MemoryArtifactStore, MemoryCacheStore};
use cinder_core::ids::InstanceId;
use cinder_core::ports::{
    OutputLine, OutputStream, SecretResolver, StepCommand, StepInvocation, StepOutcome,
    StepRunner,
};
use cinder_core::run::RunRecord;
use cinder_core::trigger::{RunRequest, TriggerEvent};
use cinder_core::workflow::{EnvMap, TriggerKind, WorkflowDefinition};
use cinder_core::{Error, Result};
use cinder_scheduler::repository::InMemoryRunRepository;
use cinder_scheduler::{
    Engine, ExecutorConfig, RetryPolicy, RunHandle, Scheduler, SchedulerConfig, StepExecutor,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// One `execute` call seen by the runner.
#[derive(Debug, Clone)]
pub struct Call {
    pub instance: InstanceId,
    pub step: String,
    pub env: EnvMap,
}

/// Interprets step scripts as a tiny command language, one command per line:
///
/// - `echo TEXT`: append TEXT to the log
/// - `env NAME`: append the value of NAME to the log
///
/// Logged lines are also sent to the invocation's output channel.
/// - `output KEY=VALUE`: set a step output
/// - `sleep MS`: sleep, stopping early on cancellation
/// - `wait`: signal `started` and block until cancelled
/// - `fail [CODE]`: exit with CODE (default 1)
/// - `timeout`: report a timed-out step
/// - `infra`: fail with an infrastructure error
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<Call>>,
    restored: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    pub started: Notify,
}

impl ScriptedRunner {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, instance: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.instance.as_str() == instance)
            .collect()
    }

    /// Archives unpacked so far, with their target directory.
    pub fn restored(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.restored.lock().unwrap().clone()
    }

    /// Highest number of steps observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn interpret(
        &self,
        invocation: &StepInvocation,
        script: &str,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let mut outcome = StepOutcome::default();
        for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "echo" => log_line(invocation, &mut outcome, arg).await,
                "env" => {
                    let value = invocation.env.get(arg).cloned().unwrap_or_default();
                    log_line(invocation, &mut outcome, &value).await;
                }
                "output" => {
                    if let Some((key, value)) = arg.split_once('=') {
                        outcome.outputs.insert(key.to_string(), value.to_string());
                    }
                }
                "sleep" => {
                    let ms = arg.parse().unwrap_or(10);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        _ = cancel.cancelled() => {
                            outcome.exit_code = 130;
                            return Ok(outcome);
                        }
                    }
                }
                "wait" => {
                    self.started.notify_one();
                    cancel.cancelled().await;
                    outcome.exit_code = 130;
                    return Ok(outcome);
                }
                "fail" => {
                    outcome.exit_code = arg.parse().unwrap_or(1);
                    return Ok(outcome);
                }
                "timeout" => {
                    outcome.exit_code = -1;
                    outcome.timed_out = true;
                    return Ok(outcome);
                }
                "infra" => return Err(Error::Infrastructure("runner unreachable".into())),
                other => panic!("unknown scripted command: {other}"),
            }
        }
        Ok(outcome)
    }
}

async fn log_line(invocation: &StepInvocation, outcome: &mut StepOutcome, content: &str) {
    outcome.log.push_str(content);
    outcome.log.push('\n');
    if let Some(tx) = &invocation.output {
        let line = OutputLine {
            instance: invocation.instance.clone(),
            step: invocation.step.clone(),
            stream: OutputStream::Stdout,
            content: content.to_string(),
            line_number: outcome.log.lines().count() as u32,
            timestamp: chrono::Utc::now(),
        };
        let _ = tx.send(line).await;
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        invocation: &StepInvocation,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        self.calls.lock().unwrap().push(Call {
            instance: invocation.instance.clone(),
            step: invocation.step.clone(),
            env: invocation.env.clone(),
        });
        let StepCommand::Script { script, .. } = &invocation.command else {
            return Err(Error::UnsupportedAction("scripted runner runs scripts only".into()));
        };

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.interpret(invocation, script, &cancel).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn collect_files(&self, paths: &[String], _dir: &Path) -> Result<Vec<u8>> {
        Ok(paths.join(",").into_bytes())
    }

    async fn restore_files(&self, archive: &[u8], dir: &Path) -> Result<()> {
        self.restored
            .lock()
            .unwrap()
            .push((dir.to_path_buf(), archive.to_vec()));
        Ok(())
    }
}

pub fn workflow(yaml: &str) -> Arc<WorkflowDefinition> {
    Arc::new(serde_yaml::from_str(yaml).expect("workflow yaml"))
}

pub fn manual() -> TriggerEvent {
    TriggerEvent::new(TriggerKind::Manual, "refs/heads/main")
}

pub struct Options {
    pub max_parallel: usize,
    pub run_timeout: Option<Duration>,
    pub secrets: Option<Arc<dyn SecretResolver>>,
    pub observer: Option<mpsc::Sender<OutputLine>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            run_timeout: None,
            secrets: None,
            observer: None,
        }
    }
}

/// An engine wired to a scripted runner and in-memory stores.
pub struct Harness {
    pub engine: Engine,
    pub runner: Arc<ScriptedRunner>,
    pub cache: Arc<MemoryCacheStore>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub runs: Arc<InMemoryRunRepository>,
    _workspace: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Options::default())
    }

    pub fn with(options: Options) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_test_writer()
            .try_init();

        let workspace = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::default());
        let cache = Arc::new(MemoryCacheStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let runs = Arc::new(InMemoryRunRepository::new());

        let mut executor = StepExecutor::new(
            runner.clone(),
            ExecutorConfig {
                workspace_root: workspace.path().to_path_buf(),
                retry: RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(1),
                    exponential: false,
                },
                ..ExecutorConfig::default()
            },
        )
        .with_cache(cache.clone())
        .with_artifacts(artifacts.clone());
        if let Some(observer) = options.observer {
            executor = executor.with_observer(observer);
        }

        let scheduler = Scheduler::new(
            Arc::new(executor),
            SchedulerConfig {
                max_parallel: options.max_parallel,
                run_timeout: options.run_timeout,
            },
        )
        .with_repository(runs.clone());

        let mut engine = Engine::new(Arc::new(scheduler));
        if let Some(secrets) = options.secrets {
            engine = engine.with_secrets(secrets);
        }

        Self {
            engine,
            runner,
            cache,
            artifacts,
            runs,
            _workspace: workspace,
        }
    }

    pub fn start(&self, workflow: Arc<WorkflowDefinition>, inputs: &[(&str, &str)]) -> RunHandle {
        let request = RunRequest {
            workflow: workflow.name.clone(),
            trigger_index: 0,
            event: manual(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.engine.start(workflow, request).expect("run starts")
    }

    pub async fn run(&self, workflow: Arc<WorkflowDefinition>) -> RunRecord {
        self.run_with(workflow, &[]).await
    }

    pub async fn run_with(
        &self,
        workflow: Arc<WorkflowDefinition>,
        inputs: &[(&str, &str)],
    ) -> RunRecord {
        tokio::time::timeout(Duration::from_secs(10), self.start(workflow, inputs).wait())
            .await
            .expect("run finishes")
            .expect("run task")
    }
}

pub fn state_of(record: &RunRecord, id: &str) -> cinder_core::run::JobState {
    record
        .job(id)
        .unwrap_or_else(|| panic!("no instance {id}"))
        .state
}
