//! Shell-based step execution on the host.

use crate::runner::{OUTPUT_ENV, RunnerConfig, parse_outputs, shell_command};
use async_trait::async_trait;
use cinder_cache::{pack, unpack};
use cinder_core::ids::InstanceId;
use cinder_core::ports::{
    OutputLine, OutputStream, StepCommand, StepInvocation, StepOutcome, StepRunner,
};
use cinder_core::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exit code reported for a step stopped by cancellation.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// Runs `run` steps as child processes on the host.
pub struct ShellRunner {
    config: RunnerConfig,
}

enum Finished {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    async fn run_script(
        &self,
        invocation: &StepInvocation,
        shell: &str,
        script: &str,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        tokio::fs::create_dir_all(&invocation.working_dir).await?;
        let output_path = std::env::temp_dir().join(format!("cinder-output-{}", Uuid::new_v4()));
        tokio::fs::write(&output_path, b"").await?;

        let (program, args) = shell_command(shell, script);
        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.config.inherit_env {
            command.env_clear();
        }
        command.envs(&invocation.env).env(OUTPUT_ENV, &output_path);

        info!(
            instance = %invocation.instance,
            step = %invocation.step,
            shell = %program,
            workspace = %invocation.working_dir.display(),
            "Executing shell step"
        );

        let mut child = command
            .spawn()
            .map_err(|e| Error::Infrastructure(format!("failed to spawn {program}: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let readers = [
            tokio::spawn(forward(
                stdout,
                OutputStream::Stdout,
                invocation.instance.clone(),
                invocation.step.clone(),
                tx.clone(),
            )),
            tokio::spawn(forward(
                stderr,
                OutputStream::Stderr,
                invocation.instance.clone(),
                invocation.step.clone(),
                tx,
            )),
        ];
        let collector = tokio::spawn(collect(rx, invocation.output.clone()));

        let finished = tokio::select! {
            status = child.wait() => Finished::Exited(
                status.map_err(|e| Error::Infrastructure(format!("failed to wait for {program}: {e}")))?,
            ),
            _ = tokio::time::sleep(invocation.timeout) => Finished::TimedOut,
            _ = cancel.cancelled() => Finished::Cancelled,
        };

        let (exit_code, timed_out) = match finished {
            Finished::Exited(status) => (status.code().unwrap_or(-1), false),
            Finished::TimedOut => {
                warn!(
                    instance = %invocation.instance,
                    step = %invocation.step,
                    timeout_secs = invocation.timeout.as_secs(),
                    "Step timed out, killing process"
                );
                child.kill().await.ok();
                (-1, true)
            }
            Finished::Cancelled => {
                info!(instance = %invocation.instance, step = %invocation.step, "Step cancelled, killing process");
                child.kill().await.ok();
                (CANCELLED_EXIT_CODE, false)
            }
        };

        let log = match timeout(self.config.drain_grace, collector).await {
            Ok(Ok(log)) => log,
            Ok(Err(e)) => return Err(Error::Internal(format!("output collector failed: {e}"))),
            Err(_) => {
                warn!(step = %invocation.step, "Output pipes still open after step ended");
                String::new()
            }
        };
        for reader in readers {
            reader.abort();
        }

        let outputs = match tokio::fs::read_to_string(&output_path).await {
            Ok(content) => parse_outputs(&content),
            Err(e) => {
                warn!(error = %e, "Step output file unreadable");
                Default::default()
            }
        };
        tokio::fs::remove_file(&output_path).await.ok();

        debug!(exit_code, timed_out, outputs = outputs.len(), "Shell step finished");
        Ok(StepOutcome {
            exit_code,
            outputs,
            log,
            timed_out,
        })
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

async fn forward<R>(
    reader: R,
    stream: OutputStream,
    instance: InstanceId,
    step: String,
    tx: mpsc::Sender<OutputLine>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut line_number = 0u32;
    while let Ok(Some(content)) = lines.next_line().await {
        line_number += 1;
        let line = OutputLine {
            instance: instance.clone(),
            step: step.clone(),
            stream,
            content,
            line_number,
            timestamp: chrono::Utc::now(),
        };
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

async fn collect(
    mut rx: mpsc::Receiver<OutputLine>,
    observer: Option<mpsc::Sender<OutputLine>>,
) -> String {
    let mut log = String::new();
    while let Some(line) = rx.recv().await {
        log.push_str(&line.content);
        log.push('\n');
        if let Some(observer) = &observer {
            // A closed observer does not stop collection.
            let _ = observer.send(line).await;
        }
    }
    log
}

#[async_trait]
impl StepRunner for ShellRunner {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(
        &self,
        invocation: &StepInvocation,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        match &invocation.command {
            StepCommand::Script { shell, script } => {
                self.run_script(invocation, shell, script, cancel).await
            }
            StepCommand::Action { reference, .. } => {
                Err(Error::UnsupportedAction(reference.clone()))
            }
        }
    }

    async fn collect_files(&self, paths: &[String], dir: &Path) -> Result<Vec<u8>> {
        let paths = paths.to_vec();
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || pack(&paths, &dir))
            .await
            .map_err(|e| Error::Internal(format!("archive task failed: {e}")))?
    }

    async fn restore_files(&self, archive: &[u8], dir: &Path) -> Result<()> {
        let archive = archive.to_vec();
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || unpack(&archive, &dir))
            .await
            .map_err(|e| Error::Internal(format!("unpack task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::ids::RunId;
    use cinder_core::workflow::EnvMap;
    use std::time::Duration;

    fn invocation(script: &str, dir: &Path) -> StepInvocation {
        StepInvocation {
            run_id: RunId::new(),
            instance: InstanceId::new("build"),
            step: "test".to_string(),
            command: StepCommand::Script {
                shell: "sh".to_string(),
                script: script.to_string(),
            },
            env: EnvMap::new(),
            working_dir: dir.to_path_buf(),
            timeout: Duration::from_secs(30),
            output: None,
        }
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::default();

        let outcome = runner
            .execute(&invocation("echo hello", dir.path()), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.log, "hello\n");
    }

    #[tokio::test]
    async fn test_shell_runner_failure() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ShellRunner::default()
            .execute(&invocation("echo oops >&2; exit 3", dir.path()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.timed_out);
        assert!(outcome.log.contains("oops"));
    }

    #[tokio::test]
    async fn test_env_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation(
            r#"echo "version=$VERSION" >> "$CINDER_OUTPUT"; printf 'notes<<END\na\nb\nEND\n' >> "$CINDER_OUTPUT""#,
            dir.path(),
        );
        inv.env.insert("VERSION".into(), "1.4.0".into());

        let outcome = ShellRunner::default()
            .execute(&inv, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.outputs.get("version").map(String::as_str), Some("1.4.0"));
        assert_eq!(outcome.outputs.get("notes").map(String::as_str), Some("a\nb"));
    }

    #[tokio::test]
    async fn test_env_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(RunnerConfig {
            inherit_env: false,
            ..Default::default()
        });
        let mut inv = invocation(r#"echo "[$HOME]""#, dir.path());
        inv.command = StepCommand::Script {
            shell: "/bin/sh".into(),
            script: r#"echo "[$HOME]""#.into(),
        };

        let outcome = runner.execute(&inv, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.log, "[]\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation("sleep 10", dir.path());
        inv.timeout = Duration::from_millis(100);

        let started = std::time::Instant::now();
        let outcome = ShellRunner::default()
            .execute(&inv, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_cancellation_kills_step() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = ShellRunner::default()
            .execute(&invocation("sleep 10", dir.path()), cancel)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, CANCELLED_EXIT_CODE);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_working_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let outcome = ShellRunner::default()
            .execute(&invocation("touch marker", &nested), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success());
        assert!(nested.join("marker").exists());
    }

    #[tokio::test]
    async fn test_actions_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation("", dir.path());
        inv.command = StepCommand::Action {
            reference: "actions/checkout@v4".into(),
            with: EnvMap::new(),
        };
        let err = ShellRunner::default()
            .execute(&inv, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAction(r) if r == "actions/checkout@v4"));
    }

    #[tokio::test]
    async fn test_observer_receives_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut inv = invocation("echo one; echo two", dir.path());
        inv.output = Some(tx);

        ShellRunner::default()
            .execute(&inv, CancellationToken::new())
            .await
            .unwrap();
        drop(inv);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.content, "one");
        assert_eq!(first.stream, OutputStream::Stdout);
        assert_eq!(first.instance, InstanceId::new("build"));
        assert_eq!(rx.recv().await.unwrap().line_number, 2);
    }

    #[tokio::test]
    async fn test_collect_and_restore_files() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("dist")).unwrap();
        std::fs::write(src.path().join("dist/app.js"), b"bundle").unwrap();

        let runner = ShellRunner::default();
        let archive = runner
            .collect_files(&["dist/".into()], src.path())
            .await
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        runner.restore_files(&archive, dest.path()).await.unwrap();
        assert_eq!(std::fs::read(dest.path().join("dist/app.js")).unwrap(), b"bundle");
    }
}
