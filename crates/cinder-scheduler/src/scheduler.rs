//! Run orchestration.
//!
//! One [`Scheduler`] owns the worker pool and the concurrency groups shared by all of
//! its runs. Each run is driven by a single task that resolves instance states, feeds
//! the ready queue and reacts to worker completions, cancellation and the run deadline.

use crate::context::RunContext;
use crate::dag::{DependencyGraph, GraphNode};
use crate::executor::{JobAssignment, JobOutcome, StepExecutor};
use crate::groups::{Acquire, ConcurrencyGroups};
use crate::queue::ReadyQueue;
use chrono::Utc;
use cinder_core::expr::{ExprContext, NeedsEntry, StatusView};
use cinder_core::ids::InstanceId;
use cinder_core::interpolation::interpolate;
use cinder_core::ports::RunRepository;
use cinder_core::run::{JobInstance, JobState, RunRecord, RunStatus};
use futures::FutureExt;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size shared by every run.
    pub max_parallel: usize,
    /// Used when the workflow sets no `timeout_minutes`.
    pub run_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            run_timeout: None,
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    groups: Arc<ConcurrencyGroups>,
    executor: Arc<StepExecutor>,
    runs: Option<Arc<dyn RunRepository>>,
}

impl Scheduler {
    pub fn new(executor: Arc<StepExecutor>, config: SchedulerConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            groups: Arc::new(ConcurrencyGroups::new()),
            executor,
            runs: None,
            config,
        }
    }

    pub fn with_repository(mut self, runs: Arc<dyn RunRepository>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn groups(&self) -> &Arc<ConcurrencyGroups> {
        &self.groups
    }

    /// Drive one run to completion and return its final record.
    pub async fn run(&self, ctx: Arc<RunContext>, graph: DependencyGraph) -> RunRecord {
        let timeout = ctx
            .workflow
            .timeout_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
            .or(self.config.run_timeout);
        let deadline = timeout.map(|t| Instant::now() + t);

        self.groups.run_started(ctx.run_id);
        let mut driver = RunDriver::new(self, ctx.clone(), graph);
        info!(
            run_id = %ctx.run_id,
            workflow = %ctx.workflow.name,
            instances = driver.record.jobs.len(),
            "Run started"
        );
        self.persist(&driver.record).await;

        let mut group_rx = self.groups.subscribe();
        let mut cancel_seen = false;

        loop {
            if ctx.is_cancelled() && !cancel_seen {
                cancel_seen = true;
                let reason = if driver.timed_out {
                    "run exceeded its timeout"
                } else {
                    "run cancelled"
                };
                driver.cancel_pending(reason);
            }

            driver.resolve();
            let blocked = driver.dispatch();

            if driver.is_done() {
                break;
            }
            if driver.workers.is_empty() && driver.queue.is_empty() {
                error!(run_id = %ctx.run_id, "Run stalled with unfinished instances");
                driver.fail_unfinished("instance lost its worker");
                break;
            }

            tokio::select! {
                _ = ctx.cancel_token().cancelled(), if !cancel_seen => {
                    info!(run_id = %ctx.run_id, "Run cancellation requested");
                }
                Some(joined) = driver.workers.join_next_with_id(), if !driver.workers.is_empty() => {
                    match joined {
                        Ok((task, (id, outcome))) => {
                            driver.task_instances.remove(&task);
                            driver.complete(id, outcome);
                        }
                        Err(e) => {
                            error!(run_id = %ctx.run_id, error = %e, "Worker task failed");
                            if let Some(id) = driver.task_instances.remove(&e.id()) {
                                driver.complete(id, JobOutcome::failed("worker task failed"));
                            }
                        }
                    }
                    self.persist(&driver.record).await;
                }
                _ = self.permits.acquire(), if blocked.permits => {}
                _ = group_rx.changed(), if blocked.groups => {}
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !driver.timed_out => {
                    warn!(run_id = %ctx.run_id, "Run timed out, cancelling");
                    driver.timed_out = true;
                    ctx.cancel_token().cancel();
                }
                else => {
                    error!(run_id = %ctx.run_id, "Run has nothing left to wait on");
                    driver.fail_unfinished("instance could not be scheduled");
                    break;
                }
            }
        }

        let record = driver.finish();
        self.groups.run_finished(ctx.run_id);
        ctx.teardown().await;
        self.persist(&record).await;

        info!(
            run_id = %record.id,
            status = ?record.status,
            duration_ms = record.duration_ms,
            "Run finished"
        );
        record
    }

    async fn persist(&self, record: &RunRecord) {
        if let Some(runs) = &self.runs
            && let Err(e) = runs.save(record).await
        {
            warn!(run_id = %record.id, error = %e, "Failed to persist run record");
        }
    }
}

/// Which resources a non-empty ready queue is waiting on.
#[derive(Debug, Default, Clone, Copy)]
struct Blocked {
    permits: bool,
    groups: bool,
}

#[derive(Debug, Clone)]
struct Membership {
    group: String,
    cancel_in_progress: bool,
}

/// Mutable state of one run.
struct RunDriver<'a> {
    scheduler: &'a Scheduler,
    ctx: Arc<RunContext>,
    graph: DependencyGraph,
    record: RunRecord,
    position: HashMap<InstanceId, usize>,
    /// Skipped because something upstream failed.
    tainted: HashSet<InstanceId>,
    succeeded: HashSet<InstanceId>,
    tokens: HashMap<InstanceId, CancellationToken>,
    memberships: HashMap<InstanceId, Membership>,
    queue: ReadyQueue,
    workers: JoinSet<(InstanceId, JobOutcome)>,
    task_instances: HashMap<task::Id, InstanceId>,
    timed_out: bool,
}

enum Decision {
    Wait,
    Ready,
    Skip { tainted: bool },
}

impl<'a> RunDriver<'a> {
    fn new(scheduler: &'a Scheduler, ctx: Arc<RunContext>, graph: DependencyGraph) -> Self {
        let jobs: Vec<JobInstance> = graph
            .nodes()
            .map(|node| {
                JobInstance::new(
                    node.id.clone(),
                    node.template.clone(),
                    node.assignment.clone(),
                    node.needs.clone(),
                )
            })
            .collect();
        let position = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| (job.id.clone(), i))
            .collect();

        let mut queue = ReadyQueue::new();
        for template in &ctx.workflow.jobs {
            if let Some(limit) = template.matrix.as_ref().and_then(|m| m.max_parallel) {
                queue.set_limit(template.name.clone(), limit);
            }
        }

        let record = RunRecord {
            id: ctx.run_id,
            workflow: ctx.workflow.name.clone(),
            trigger: ctx.event.kind,
            git_ref: ctx.event.git_ref.clone(),
            status: RunStatus::Running,
            jobs,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };

        Self {
            scheduler,
            ctx,
            graph,
            record,
            position,
            tainted: HashSet::new(),
            succeeded: HashSet::new(),
            tokens: HashMap::new(),
            memberships: HashMap::new(),
            queue,
            workers: JoinSet::new(),
            task_instances: HashMap::new(),
            timed_out: false,
        }
    }

    fn job(&self, id: &InstanceId) -> Option<&JobInstance> {
        self.position.get(id).map(|&i| &self.record.jobs[i])
    }

    fn job_mut(&mut self, id: &InstanceId) -> Option<&mut JobInstance> {
        self.position.get(id).map(|&i| &mut self.record.jobs[i])
    }

    fn state(&self, id: &InstanceId) -> JobState {
        self.job(id).map_or(JobState::Pending, |job| job.state)
    }

    fn set_state(&mut self, id: &InstanceId, state: JobState, error: Option<String>) {
        if let Some(job) = self.job_mut(id) {
            job.state = state;
            if error.is_some() {
                job.error = error;
            }
            if state.is_terminal() && job.completed_at.is_none() {
                job.completed_at = Some(Utc::now());
            }
        }
    }

    fn continues_on_error(&self, id: &InstanceId) -> bool {
        self.ctx
            .workflow
            .job(id.template())
            .is_some_and(|t| t.continue_on_error)
    }

    /// State as seen by dependents: a failure tolerated by `continue_on_error` gates
    /// like a success.
    fn gate_state(&self, id: &InstanceId) -> JobState {
        match self.state(id) {
            JobState::Failed if self.continues_on_error(id) => JobState::Succeeded,
            state => state,
        }
    }

    fn is_failure(&self, id: &InstanceId) -> bool {
        self.gate_state(id) == JobState::Failed || self.tainted.contains(id)
    }

    fn is_done(&self) -> bool {
        self.record.jobs.iter().all(|job| job.state.is_terminal())
    }

    /// `needs` context for a node: per upstream template, the combined result and
    /// outputs of its instances in id order.
    fn needs_context(&self, node: &GraphNode) -> IndexMap<String, NeedsEntry> {
        let mut by_template: IndexMap<String, Vec<&JobInstance>> = IndexMap::new();
        for dep in &node.needs {
            if let Some(job) = self.job(dep) {
                by_template.entry(job.template.clone()).or_default().push(job);
            }
        }

        by_template
            .into_iter()
            .map(|(template, mut jobs)| {
                jobs.sort_by(|a, b| a.id.cmp(&b.id));
                let states: Vec<JobState> = jobs.iter().map(|j| self.gate_state(&j.id)).collect();
                let result = if states.contains(&JobState::Failed) {
                    JobState::Failed
                } else if states.contains(&JobState::Cancelled) {
                    JobState::Cancelled
                } else if states.contains(&JobState::Succeeded) {
                    JobState::Succeeded
                } else {
                    JobState::Skipped
                };
                let mut outputs = IndexMap::new();
                for job in &jobs {
                    outputs.extend(job.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                (
                    template,
                    NeedsEntry {
                        result: result.as_str().to_string(),
                        outputs,
                    },
                )
            })
            .collect()
    }

    fn expr_context(&self, node: &GraphNode, status: StatusView) -> ExprContext {
        let mut expr = self.ctx.expr_context();
        expr.matrix = node.assignment.clone();
        expr.needs = self.needs_context(node);
        expr.status = status;
        expr
    }

    fn decide(&self, node: &GraphNode) -> Decision {
        let deps: Vec<JobState> = node.needs.iter().map(|d| self.gate_state(d)).collect();
        let upstream_failed = node.needs.iter().any(|d| self.is_failure(d));

        if !node.condition.references_status()
            && deps
                .iter()
                .any(|s| matches!(s, JobState::Failed | JobState::Cancelled | JobState::Skipped))
        {
            return Decision::Skip {
                tainted: upstream_failed,
            };
        }
        if !deps.iter().all(|s| s.is_terminal()) {
            return Decision::Wait;
        }

        let status = StatusView {
            failed: upstream_failed,
            cancelled: self.ctx.is_cancelled() || deps.contains(&JobState::Cancelled),
        };
        if node.condition.evaluate(&self.expr_context(node, status)) {
            Decision::Ready
        } else {
            Decision::Skip {
                tainted: upstream_failed,
            }
        }
    }

    /// Settle every waiting instance whose dependencies allow a decision, until nothing
    /// changes. Newly ready instances of one pass share a queue tick.
    fn resolve(&mut self) {
        if self.ctx.is_cancelled() {
            return;
        }
        let mut tick = None;
        loop {
            let waiting: Vec<InstanceId> = self
                .record
                .jobs
                .iter()
                .filter(|job| matches!(job.state, JobState::Pending | JobState::Blocked))
                .map(|job| job.id.clone())
                .collect();

            let mut changed = false;
            for id in waiting {
                let Some(node) = self.graph.node(&id) else {
                    continue;
                };
                let before = self.state(&id);
                match self.decide(node) {
                    Decision::Wait => {
                        if self.state(&id) == JobState::Pending {
                            self.set_state(&id, JobState::Blocked, None);
                        }
                    }
                    Decision::Skip { tainted } => {
                        info!(run_id = %self.ctx.run_id, instance = %id, "Job skipped");
                        if tainted {
                            self.tainted.insert(id.clone());
                        }
                        self.set_state(&id, JobState::Skipped, None);
                        changed |= self.state(&id) != before;
                    }
                    Decision::Ready => {
                        let t = *tick.get_or_insert_with(|| self.queue.next_tick());
                        self.make_ready(id.clone(), t);
                        changed |= self.state(&id) != before;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn make_ready(&mut self, id: InstanceId, tick: u64) {
        let run_id = self.ctx.run_id;
        self.tokens
            .insert(id.clone(), self.ctx.cancel_token().child_token());

        let concurrency = self
            .ctx
            .workflow
            .job(id.template())
            .and_then(|t| t.concurrency.clone());
        if let Some(spec) = concurrency
            && let Some(node) = self.graph.node(&id)
        {
            let expr = self.expr_context(node, StatusView::default());
            match interpolate(&spec.group, &expr) {
                Ok(group) => {
                    self.scheduler
                        .groups
                        .enter(&group, run_id, spec.cancel_in_progress);
                    self.memberships.insert(
                        id.clone(),
                        Membership {
                            group,
                            cancel_in_progress: spec.cancel_in_progress,
                        },
                    );
                }
                Err(e) => warn!(instance = %id, error = %e, "Concurrency group not rendered, ignoring"),
            }
        }

        debug!(run_id = %run_id, instance = %id, tick, "Job ready");
        self.set_state(&id, JobState::Ready, None);
        self.queue.push(tick, id);
    }

    /// Hand queued instances to workers while permits and groups allow.
    fn dispatch(&mut self) -> Blocked {
        let mut blocked = Blocked::default();
        let run_id = self.ctx.run_id;

        while !self.queue.is_empty() {
            let Ok(permit) = self.scheduler.permits.clone().try_acquire_owned() else {
                blocked.permits = true;
                break;
            };

            let memberships = &self.memberships;
            let tokens = &self.tokens;
            let groups = &self.scheduler.groups;
            let mut superseded = Vec::new();
            let mut busy = false;
            let next = self.queue.pop_dispatchable(|id| {
                let Some(member) = memberships.get(id) else {
                    return true;
                };
                let token = tokens.get(id).cloned().unwrap_or_default();
                match groups.try_acquire(
                    &member.group,
                    run_id,
                    id,
                    member.cancel_in_progress,
                    &token,
                ) {
                    Acquire::Granted => true,
                    Acquire::Busy => {
                        busy = true;
                        false
                    }
                    Acquire::Superseded => {
                        superseded.push(id.clone());
                        false
                    }
                }
            });

            let progressed = !superseded.is_empty();
            for id in superseded {
                self.queue.remove(&id);
                info!(run_id = %run_id, instance = %id, "Job superseded by a newer run");
                self.set_state(
                    &id,
                    JobState::Cancelled,
                    Some("superseded by a newer run in its concurrency group".into()),
                );
            }

            match next {
                Some(id) => self.spawn(id, permit),
                None => {
                    drop(permit);
                    if progressed {
                        continue;
                    }
                    blocked.groups = busy;
                    break;
                }
            }
        }
        blocked
    }

    fn spawn(&mut self, id: InstanceId, permit: OwnedSemaphorePermit) {
        let Some(node) = self.graph.node(&id) else {
            return;
        };
        let assignment = JobAssignment {
            instance: id.clone(),
            template: node.template.clone(),
            matrix: node.assignment.clone(),
            needs: self.needs_context(node),
            succeeded: self.succeeded.clone(),
            cancel: self.tokens.get(&id).cloned().unwrap_or_default(),
        };

        if let Some(job) = self.job_mut(&id) {
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
        }
        info!(run_id = %self.ctx.run_id, instance = %id, "Job dispatched");

        let executor = self.scheduler.executor.clone();
        let ctx = self.ctx.clone();
        let instance = id.clone();
        let handle = self.workers.spawn(async move {
            let _permit = permit;
            let outcome = AssertUnwindSafe(executor.execute(&ctx, assignment))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| JobOutcome::failed("worker panicked"));
            (instance, outcome)
        });
        self.task_instances.insert(handle.id(), id);
    }

    fn complete(&mut self, id: InstanceId, outcome: JobOutcome) {
        self.queue.finished(&id);
        if let Some(member) = self.memberships.get(&id) {
            self.scheduler
                .groups
                .release(&member.group, self.ctx.run_id, &id);
        }

        // Cancellation wins over failures it caused.
        let state = match outcome.state {
            JobState::Failed if self.ctx.is_cancelled() => JobState::Cancelled,
            state => state,
        };

        if let Some(job) = self.job_mut(&id) {
            job.state = state;
            job.steps = outcome.steps;
            job.outputs = outcome.outputs;
            job.artifacts = outcome.artifacts;
            job.caches = outcome.caches;
            job.error = outcome.error;
            job.started_at.get_or_insert(outcome.started_at);
            job.completed_at = Some(outcome.completed_at);
        }
        if state == JobState::Succeeded {
            self.succeeded.insert(id.clone());
        }

        info!(
            run_id = %self.ctx.run_id,
            instance = %id,
            state = state.as_str(),
            "Job completed"
        );
    }

    /// Cancel every instance that has not started.
    fn cancel_pending(&mut self, reason: &str) {
        self.queue.drain();
        let pending: Vec<InstanceId> = self
            .record
            .jobs
            .iter()
            .filter(|job| {
                matches!(
                    job.state,
                    JobState::Pending | JobState::Blocked | JobState::Ready
                )
            })
            .map(|job| job.id.clone())
            .collect();
        for id in pending {
            self.set_state(&id, JobState::Cancelled, Some(reason.to_string()));
        }
    }

    fn fail_unfinished(&mut self, reason: &str) {
        let unfinished: Vec<InstanceId> = self
            .record
            .jobs
            .iter()
            .filter(|job| !job.state.is_terminal())
            .map(|job| job.id.clone())
            .collect();
        for id in unfinished {
            self.set_state(&id, JobState::Failed, Some(reason.to_string()));
        }
    }

    fn finish(mut self) -> RunRecord {
        let failed = self
            .record
            .jobs
            .iter()
            .any(|job| job.state == JobState::Failed && !self.continues_on_error(&job.id));
        let cancelled = self.ctx.is_cancelled()
            || self
                .record
                .jobs
                .iter()
                .any(|job| job.state == JobState::Cancelled);
        self.record.status = if cancelled {
            RunStatus::Cancelled
        } else if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        let now = Utc::now();
        self.record.completed_at = Some(now);
        self.record.duration_ms =
            Some((now - self.record.started_at).num_milliseconds().max(0) as u64);
        self.record
    }
}
