//! Concurrency groups shared by every run of one scheduler.

use cinder_core::ids::{InstanceId, RunId};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Result of asking for a group slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    /// Another member holds the group; retry after the next release.
    Busy,
    /// A newer run entered a `cancel_in_progress` group; this member must not run.
    Superseded,
}

#[derive(Debug)]
struct Holder {
    run_id: RunId,
    instance: InstanceId,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct GroupState {
    holder: Option<Holder>,
    newest_run: Option<RunId>,
}

#[derive(Debug, Default)]
struct Registry {
    groups: HashMap<String, GroupState>,
    /// Runs currently driven by the owning scheduler.
    active_runs: HashSet<RunId>,
}

impl Registry {
    /// A group entry is kept while it has a holder or an active run older than its
    /// newest run could still be superseded.
    fn needed(&self, state: &GroupState) -> bool {
        state.holder.is_some()
            || state
                .newest_run
                .is_some_and(|newest| self.active_runs.iter().any(|run| *run < newest))
    }

    fn prune(&mut self, group: &str) {
        let unneeded = self.groups.get(group).is_some_and(|state| !self.needed(state));
        if unneeded {
            self.groups.remove(group);
        }
    }
}

/// At most one running member per group. Releases bump a `watch` generation counter so
/// waiting schedulers can re-check without polling.
#[derive(Debug)]
pub struct ConcurrencyGroups {
    registry: Mutex<Registry>,
    generation: watch::Sender<u64>,
}

impl Default for ConcurrencyGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyGroups {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            registry: Mutex::new(Registry::default()),
            generation,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn run_started(&self, run_id: RunId) {
        self.lock().active_runs.insert(run_id);
    }

    /// Forget a finished run and drop the group entries nothing needs any more.
    pub fn run_finished(&self, run_id: RunId) {
        let mut registry = self.lock();
        registry.active_runs.remove(&run_id);
        let unneeded: Vec<String> = registry
            .groups
            .iter()
            .filter(|(_, state)| !registry.needed(state))
            .map(|(name, _)| name.clone())
            .collect();
        for name in unneeded {
            registry.groups.remove(&name);
        }
    }

    /// Number of groups currently tracked.
    pub fn len(&self) -> usize {
        self.lock().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that a run has a member ready for `group`.
    ///
    /// With `cancel_in_progress`, an older run's running member is cancelled.
    pub fn enter(&self, group: &str, run_id: RunId, cancel_in_progress: bool) {
        let mut registry = self.lock();
        let state = registry.groups.entry(group.to_string()).or_default();

        if state.newest_run.is_none_or(|newest| newest < run_id) {
            state.newest_run = Some(run_id);
        }

        if cancel_in_progress
            && let Some(holder) = &state.holder
            && holder.run_id < run_id
            && !holder.cancel.is_cancelled()
        {
            info!(
                group,
                run_id = %holder.run_id,
                instance = %holder.instance,
                superseded_by = %run_id,
                "Cancelling in-progress group member"
            );
            holder.cancel.cancel();
        }
        drop(registry);
        self.bump();
    }

    /// Whether a newer run has entered the group.
    pub fn is_superseded(&self, group: &str, run_id: RunId, cancel_in_progress: bool) -> bool {
        if !cancel_in_progress {
            return false;
        }
        self.lock()
            .groups
            .get(group)
            .and_then(|state| state.newest_run)
            .is_some_and(|newest| newest > run_id)
    }

    pub fn try_acquire(
        &self,
        group: &str,
        run_id: RunId,
        instance: &InstanceId,
        cancel_in_progress: bool,
        cancel: &CancellationToken,
    ) -> Acquire {
        if self.is_superseded(group, run_id, cancel_in_progress) {
            return Acquire::Superseded;
        }

        let mut registry = self.lock();
        let state = registry.groups.entry(group.to_string()).or_default();
        if state.holder.is_some() {
            return Acquire::Busy;
        }
        state.holder = Some(Holder {
            run_id,
            instance: instance.clone(),
            cancel: cancel.clone(),
        });
        Acquire::Granted
    }

    /// Release the group if `instance` of `run_id` holds it.
    pub fn release(&self, group: &str, run_id: RunId, instance: &InstanceId) {
        let mut registry = self.lock();
        let Some(state) = registry.groups.get_mut(group) else {
            return;
        };
        let holds = state
            .holder
            .as_ref()
            .is_some_and(|h| h.run_id == run_id && &h.instance == instance);
        if holds {
            state.holder = None;
            registry.prune(group);
            drop(registry);
            self.bump();
        }
    }

    /// Current holder of a group, if any.
    pub fn holder(&self, group: &str) -> Option<(RunId, InstanceId)> {
        self.lock()
            .groups
            .get(group)
            .and_then(|state| state.holder.as_ref())
            .map(|h| (h.run_id, h.instance.clone()))
    }
}
