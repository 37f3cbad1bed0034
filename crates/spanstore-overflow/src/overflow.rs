//! Asynchronous overflow cycles
//!
//! Each cycle scores shard activity since the previous cycle, opens the
//! historical view of every shard in the snapshot and then either runs the
//! planned tasks against the cycle deadline or schedules builds and merges
//! on the bounded pools followed by the split actions of merged shards.

use crate::error::OverflowResult;
use crate::metadata::OverflowMetadata;
use crate::node::DataNode;
use crate::planner::{ActionPlanner, PlannedTask};
use crate::scheduler::{TaskOutcome, run_tasks, schedule_and_await_tasks};
use crate::tasks::TaskReport;
use spanstore_common::{CommitTime, OverflowAction, OverflowMode, ShardName};
use spanstore_storage::OverflowSnapshot;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Summary of one asynchronous overflow cycle
#[derive(Clone, Debug)]
pub struct OverflowReport {
    pub last_commit_time: CommitTime,
    /// Action recorded for each shard of the snapshot, if any
    pub actions: BTreeMap<ShardName, Option<OverflowAction>>,
    /// Tasks run against the cycle deadline
    pub planned: Vec<PlannedTask>,
    pub outcomes: Vec<TaskOutcome>,
    pub elapsed: Duration,
}

impl OverflowReport {
    pub fn completed(&self) -> impl Iterator<Item = &TaskReport> {
        self.outcomes.iter().filter_map(TaskOutcome::report)
    }

    /// Committed tasks of the given action
    #[must_use]
    pub fn count(&self, action: OverflowAction) -> usize {
        self.completed().filter(|r| r.action == action).count()
    }

    /// Tasks that did not complete, dropped ones aside
    #[must_use]
    pub fn incomplete(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.is_completed() && !matches!(o, TaskOutcome::Dropped))
            .count()
    }
}

impl DataNode {
    /// Score activity since the previous cycle and open the historical view
    /// of every shard in `snapshot`
    pub async fn collect_metadata(
        &self,
        snapshot: &OverflowSnapshot,
    ) -> OverflowResult<OverflowMetadata> {
        let scores = self.scores.mark_and_score(&self.store.write_counters());
        OverflowMetadata::collect(
            self.store.as_ref(),
            self.metadata_index.as_ref(),
            &self.config,
            snapshot,
            scores,
        )
        .await
    }

    /// Run one asynchronous overflow cycle over `snapshot`
    pub async fn asynchronous_overflow(
        self: &Arc<Self>,
        snapshot: OverflowSnapshot,
    ) -> OverflowResult<OverflowReport> {
        self.run_cycle(&snapshot, false).await
    }

    /// Rotate the live journal and compact every shard into one segment
    pub async fn force_compacting_merges(self: &Arc<Self>) -> OverflowResult<OverflowReport> {
        let _cycle = self.overflow_lock.lock().await;
        let snapshot = self.synchronous_overflow()?;
        self.run_cycle(&snapshot, true).await
    }

    async fn run_cycle(
        self: &Arc<Self>,
        snapshot: &OverflowSnapshot,
        force_compacting_merges: bool,
    ) -> OverflowResult<OverflowReport> {
        let started = Instant::now();
        let deadline = started + self.config.overflow_timeout();
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);

        let metadata = Arc::new(self.collect_metadata(snapshot).await?);
        let result = self
            .run_tasks_of_cycle(&metadata, force_compacting_merges, deadline)
            .await;
        let actions = metadata
            .views()
            .map(|vmd| (vmd.name.clone(), vmd.action()))
            .collect();
        metadata.clear_views();
        let (planned, outcomes) = result?;

        let report = OverflowReport {
            last_commit_time: snapshot.last_commit_time,
            actions,
            planned,
            outcomes,
            elapsed: started.elapsed(),
        };
        info!(
            "Overflow cycle at commit time {} on {}: {} tasks, {} incomplete, {:?}",
            report.last_commit_time,
            self.name,
            report.outcomes.len(),
            report.incomplete(),
            report.elapsed
        );
        Ok(report)
    }

    async fn run_tasks_of_cycle(
        self: &Arc<Self>,
        metadata: &Arc<OverflowMetadata>,
        force_compacting_merges: bool,
        deadline: Instant,
    ) -> OverflowResult<(Vec<PlannedTask>, Vec<TaskOutcome>)> {
        match self.config.mode {
            OverflowMode::Planned => {
                if force_compacting_merges {
                    for vmd in metadata.views() {
                        vmd.clear_copy();
                    }
                }
                let planned = ActionPlanner::new(self, metadata)
                    .choose_tasks(force_compacting_merges)
                    .await?;
                let outcomes = run_tasks(self, metadata, planned.clone(), deadline).await;
                Ok((planned, outcomes))
            }
            OverflowMode::AfterAction => {
                let (mut outcomes, follow_ups) =
                    schedule_and_await_tasks(self, metadata, force_compacting_merges).await;
                outcomes.extend(run_tasks(self, metadata, follow_ups.clone(), deadline).await);
                Ok((follow_ups, outcomes))
            }
        }
    }
}
