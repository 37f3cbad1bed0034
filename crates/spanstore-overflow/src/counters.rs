//! Overflow activity counters

use serde::Serialize;
use spanstore_common::OverflowAction;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for overflow processing on one node
#[derive(Debug, Default)]
pub struct OverflowCounters {
    /// Asynchronous overflow cycles started
    pub cycles: AtomicU64,
    /// Tasks that ran to completion
    pub task_completed: AtomicU64,
    /// Tasks that failed with an error
    pub task_failed: AtomicU64,
    /// Tasks cancelled at the cycle deadline
    pub task_cancelled: AtomicU64,
    /// Tasks dropped because another action claimed the shard first
    pub task_dropped: AtomicU64,
    /// Tasks never started because the cycle ran out of time
    pub task_abandoned: AtomicU64,
    pub build: AtomicU64,
    pub merge: AtomicU64,
    pub split: AtomicU64,
    pub tail_split: AtomicU64,
    pub scatter_split: AtomicU64,
    pub join: AtomicU64,
    #[allow(clippy::struct_field_names)]
    pub moves: AtomicU64,
    /// Shards received from other nodes
    pub receive: AtomicU64,
}

/// Point-in-time copy of [`OverflowCounters`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub cycles: u64,
    pub task_completed: u64,
    pub task_failed: u64,
    pub task_cancelled: u64,
    pub task_dropped: u64,
    pub task_abandoned: u64,
    pub build: u64,
    pub merge: u64,
    pub split: u64,
    pub tail_split: u64,
    pub scatter_split: u64,
    pub join: u64,
    pub moves: u64,
    pub receive: u64,
}

impl OverflowCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a committed action
    pub fn record(&self, action: OverflowAction) {
        let counter = match action {
            OverflowAction::Copy => return,
            OverflowAction::Build => &self.build,
            OverflowAction::Merge => &self.merge,
            OverflowAction::Split => &self.split,
            OverflowAction::TailSplit => &self.tail_split,
            OverflowAction::ScatterSplit => &self.scatter_split,
            OverflowAction::Join => &self.join,
            OverflowAction::Move => &self.moves,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            cycles: get(&self.cycles),
            task_completed: get(&self.task_completed),
            task_failed: get(&self.task_failed),
            task_cancelled: get(&self.task_cancelled),
            task_dropped: get(&self.task_dropped),
            task_abandoned: get(&self.task_abandoned),
            build: get(&self.build),
            merge: get(&self.merge),
            split: get(&self.split),
            tail_split: get(&self.tail_split),
            scatter_split: get(&self.scatter_split),
            join: get(&self.join),
            moves: get(&self.moves),
            receive: get(&self.receive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_actions() {
        let counters = OverflowCounters::new();
        counters.record(OverflowAction::Build);
        counters.record(OverflowAction::Build);
        counters.record(OverflowAction::Move);
        counters.record(OverflowAction::Copy);
        counters.task_failed.fetch_add(1, Ordering::Relaxed);

        let snap = counters.snapshot();
        assert_eq!(snap.build, 2);
        assert_eq!(snap.moves, 1);
        assert_eq!(snap.task_failed, 1);
        assert_eq!(snap.merge, 0);
    }
}
