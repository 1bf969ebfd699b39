//! Ready queue for instances waiting on a worker.

use cinder_core::ids::InstanceId;
use std::collections::{BTreeSet, HashMap};

/// FIFO of ready instances, ordered by the resolution pass that made them ready and
/// then by instance id. Also enforces per-template `max_parallel` limits.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: BTreeSet<(u64, InstanceId)>,
    tick: u64,
    running: HashMap<String, u32>,
    limits: HashMap<String, u32>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap concurrently running instances of a template.
    pub fn set_limit(&mut self, template: impl Into<String>, max_parallel: u32) {
        self.limits.insert(template.into(), max_parallel.max(1));
    }

    /// Start a new resolution pass. Instances pushed with the same tick share a FIFO slot.
    pub fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn push(&mut self, tick: u64, id: InstanceId) {
        self.entries.insert((tick, id));
    }

    /// Remove and return the first instance whose template is under its limit and which
    /// `eligible` accepts. The template's running count is incremented.
    pub fn pop_dispatchable(
        &mut self,
        mut eligible: impl FnMut(&InstanceId) -> bool,
    ) -> Option<InstanceId> {
        let entry = self
            .entries
            .iter()
            .find(|(_, id)| self.has_capacity(id.template()) && eligible(id))
            .cloned()?;
        self.entries.remove(&entry);
        *self.running.entry(entry.1.template().to_string()).or_insert(0) += 1;
        Some(entry.1)
    }

    /// Release the template slot held by a finished instance.
    pub fn finished(&mut self, id: &InstanceId) {
        if let Some(count) = self.running.get_mut(id.template()) {
            *count = count.saturating_sub(1);
        }
    }

    fn has_capacity(&self, template: &str) -> bool {
        match self.limits.get(template) {
            Some(limit) => self.running.get(template).copied().unwrap_or(0) < *limit,
            None => true,
        }
    }

    pub fn remove(&mut self, id: &InstanceId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(_, queued)| queued != id);
        self.entries.len() != before
    }

    /// Empty the queue, returning everything still waiting in dispatch order.
    pub fn drain(&mut self) -> Vec<InstanceId> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(_, id)| id)
            .collect()
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.entries.iter().any(|(_, queued)| queued == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InstanceId {
        InstanceId::new(s)
    }

    #[test]
    fn test_fifo_by_tick_then_id() {
        let mut queue = ReadyQueue::new();
        let first = queue.next_tick();
        queue.push(first, id("lint"));
        let second = queue.next_tick();
        queue.push(second, id("test#18"));
        queue.push(second, id("test#16"));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_dispatchable(|_| true)).collect();
        assert_eq!(order, vec![id("lint"), id("test#16"), id("test#18")]);
    }

    #[test]
    fn test_template_limit() {
        let mut queue = ReadyQueue::new();
        queue.set_limit("test", 1);
        let tick = queue.next_tick();
        queue.push(tick, id("test#16"));
        queue.push(tick, id("test#18"));
        queue.push(tick, id("zlint"));

        assert_eq!(queue.pop_dispatchable(|_| true), Some(id("test#16")));
        // test#18 is held back by the limit; other templates still dispatch.
        assert_eq!(queue.pop_dispatchable(|_| true), Some(id("zlint")));
        assert_eq!(queue.pop_dispatchable(|_| true), None);

        queue.finished(&id("test#16"));
        assert_eq!(queue.pop_dispatchable(|_| true), Some(id("test#18")));
    }

    #[test]
    fn test_ineligible_entries_stay_queued() {
        let mut queue = ReadyQueue::new();
        let tick = queue.next_tick();
        queue.push(tick, id("deploy"));
        assert_eq!(queue.pop_dispatchable(|_| false), None);
        assert!(queue.contains(&id("deploy")));
        assert_eq!(queue.drain(), vec![id("deploy")]);
        assert!(queue.is_empty());
    }
}
