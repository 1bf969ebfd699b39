//! Entry point tying trigger evaluation, graph construction and scheduling together.

use crate::context::RunContext;
use crate::dag::DependencyGraph;
use crate::scheduler::Scheduler;
use crate::triggers::{TriggerEvaluator, validate_triggers};
use cinder_core::ids::RunId;
use cinder_core::ports::{ScheduleClock, SecretResolver};
use cinder_core::run::RunRecord;
use cinder_core::trigger::{RunRequest, TriggerEvent};
use cinder_core::workflow::WorkflowDefinition;
use cinder_core::{ConfigError, Error, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Engine {
    scheduler: Arc<Scheduler>,
    secrets: Option<Arc<dyn SecretResolver>>,
}

impl Engine {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            secrets: None,
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Check a workflow without running it and return its expanded graph.
    pub fn validate(workflow: &WorkflowDefinition) -> std::result::Result<DependencyGraph, ConfigError> {
        validate_triggers(workflow)?;
        DependencyGraph::build(workflow)
    }

    /// Start one run per trigger spec the event satisfies.
    pub fn handle_event(
        &self,
        workflow: Arc<WorkflowDefinition>,
        event: &TriggerEvent,
        clock: &dyn ScheduleClock,
    ) -> Result<Vec<RunHandle>> {
        let requests = TriggerEvaluator::new(clock).evaluate(&workflow, event);
        if requests.is_empty() {
            info!(workflow = %workflow.name, kind = %event.kind, "Event started no runs");
            return Ok(Vec::new());
        }
        requests
            .into_iter()
            .map(|request| self.start(workflow.clone(), request))
            .collect()
    }

    /// Validate the workflow and start a run. A definition error dispatches nothing.
    pub fn start(&self, workflow: Arc<WorkflowDefinition>, request: RunRequest) -> Result<RunHandle> {
        let graph = Self::validate(&workflow).inspect_err(|e| {
            warn!(workflow = %workflow.name, error = %e, "Workflow rejected");
        })?;

        let run_id = RunId::new();
        let ctx = Arc::new(RunContext::new(
            run_id,
            workflow,
            request.event,
            request.inputs,
            self.secrets.clone(),
        ));
        let cancel = ctx.cancel_token().clone();

        info!(
            run_id = %run_id,
            workflow = %ctx.workflow.name,
            trigger = request.trigger_index,
            "Run accepted"
        );

        let scheduler = self.scheduler.clone();
        let task = tokio::spawn(async move { scheduler.run(ctx, graph).await });
        Ok(RunHandle {
            run_id,
            cancel,
            task,
        })
    }
}

/// A run in progress.
pub struct RunHandle {
    run_id: RunId,
    cancel: CancellationToken,
    task: JoinHandle<RunRecord>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation. Running steps are stopped; unstarted instances are cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunRecord> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {e}")))
    }
}
