//! A runner that executes nothing.

use async_trait::async_trait;
use cinder_core::Result;
use cinder_core::ports::{StepCommand, StepInvocation, StepOutcome, StepRunner};
use std::path::Path;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Reports every step as successful and remembers what it was asked to run.
///
/// Archives are empty, so cache and artifact plumbing still works end to end.
#[derive(Default)]
pub struct DryRunner {
    invocations: Mutex<Vec<StepInvocation>>,
}

impl DryRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invocations seen so far, in call order.
    pub fn invocations(&self) -> Vec<StepInvocation> {
        self.invocations
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StepRunner for DryRunner {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn execute(
        &self,
        invocation: &StepInvocation,
        _cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        let log = match &invocation.command {
            StepCommand::Script { shell, script } => format!("[dry-run] {shell}: {script}\n"),
            StepCommand::Action { reference, with } => {
                let args: Vec<String> = with.iter().map(|(k, v)| format!("{k}={v}")).collect();
                format!("[dry-run] uses {reference} {}\n", args.join(" "))
            }
        };
        info!(instance = %invocation.instance, step = %invocation.step, "Dry-run step");

        if let Ok(mut seen) = self.invocations.lock() {
            seen.push(invocation.clone());
        }
        Ok(StepOutcome {
            log,
            ..Default::default()
        })
    }

    async fn collect_files(&self, _paths: &[String], _dir: &Path) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn restore_files(&self, _archive: &[u8], _dir: &Path) -> Result<()> {
        Ok(())
    }
}
