//! Per-shard overflow metadata
//!
//! At the start of each asynchronous overflow cycle every shard of the
//! snapshot gets a [`ShardViewMetadata`]: its historical view pinned at the
//! snapshot commit time, statistics derived from that view, and the action
//! chosen for it. The action slot doubles as the shard's decision lock; at
//! most one action is ever recorded per shard per cycle.

use crate::error::OverflowResult;
use crate::score::Score;
use parking_lot::Mutex;
use spanstore_client::MetadataIndex;
use spanstore_common::{
    CommitTime, KeyRange, OverflowAction, OverflowConfig, ScatterSplitConfig, ShardName,
};
use spanstore_storage::{OverflowSnapshot, ShardStore, View};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Statistics of a shard's view at the snapshot commit time
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShardStats {
    pub journal_count: usize,
    pub segment_count: usize,
    /// Journals and segments in the view
    pub source_count: usize,
    /// Exactly one journal and one segment
    pub compact: bool,
    /// Upper bound on tuples in the view
    pub range_count: u64,
    /// Tuples buffered on the view's journals
    pub journal_entry_count: u64,
    pub journal_bytes: u64,
    pub segment_bytes: u64,
    /// Journal bytes relative to the nominal shard size
    pub build_priority: f64,
    /// Zero when there is no reason to merge
    pub merge_priority: f64,
    /// Segment bytes relative to the nominal shard size
    pub percent_of_split: f64,
    /// Large enough and dominated by appends past the right-most key
    pub tail_split: bool,
    /// Too many journals or segments; the view must be compacted
    pub mandatory_merge: bool,
}

impl ShardStats {
    /// Derive the statistics of `view`. `score` carries the write activity
    /// since the previous cycle.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(view: &View, score: Option<&Score>, config: &OverflowConfig) -> Self {
        let nominal = config.nominal_shard_size.max(1) as f64;
        let journal_count = view.journal_count();
        let segment_count = view.segment_count();
        let journal_bytes = view.journal_bytes();
        let segment_bytes = view.segment_bytes();
        let percent_of_split = segment_bytes as f64 / nominal;
        let merge_priority = if segment_count <= 1 {
            0.0
        } else {
            segment_count as f64 + segment_bytes as f64 / nominal
        };
        let tail_split = percent_of_split > config.percent_of_split_threshold
            && score.map_or(0.0, Score::append_ratio) > config.tail_split_threshold;

        Self {
            journal_count,
            segment_count,
            source_count: journal_count + segment_count,
            compact: view.is_compact(),
            range_count: view.range_count(&view.range().left, view.range().right.as_deref()),
            journal_entry_count: view.journal_entry_count(),
            journal_bytes,
            segment_bytes,
            build_priority: journal_bytes as f64 / nominal,
            merge_priority,
            percent_of_split,
            tail_split,
            mandatory_merge: config.is_mandatory_merge(journal_count, segment_count),
        }
    }

    /// Bytes held by the view
    #[must_use]
    pub const fn size_on_disk(&self) -> u64 {
        self.journal_bytes + self.segment_bytes
    }
}

/// Overflow metadata of one shard for one cycle
#[derive(Debug)]
pub struct ShardViewMetadata {
    pub name: ShardName,
    pub range: KeyRange,
    /// Set while the shard is still landing from a move
    pub source_partition_id: Option<u32>,
    pub scatter: ScatterSplitConfig,
    /// Buffered writes were copied onto the new journal
    pub copied: bool,
    pub stats: ShardStats,
    action: Mutex<Option<OverflowAction>>,
    view: Mutex<Option<Arc<View>>>,
}

impl ShardViewMetadata {
    #[must_use]
    pub fn new(
        name: ShardName,
        range: KeyRange,
        view: Option<View>,
        stats: ShardStats,
    ) -> Self {
        Self {
            name,
            range,
            source_partition_id: None,
            scatter: ScatterSplitConfig::default(),
            copied: false,
            stats,
            action: Mutex::new(None),
            view: Mutex::new(view.map(Arc::new)),
        }
    }

    #[must_use]
    pub fn with_source_partition_id(mut self, pid: Option<u32>) -> Self {
        self.source_partition_id = pid;
        self
    }

    #[must_use]
    pub fn with_scatter(mut self, scatter: ScatterSplitConfig) -> Self {
        self.scatter = scatter;
        self
    }

    /// Mark the shard as copied at synchronous overflow; it needs no work
    #[must_use]
    pub fn with_copied(mut self, copied: bool) -> Self {
        self.copied = copied;
        if copied {
            *self.action.get_mut() = Some(OverflowAction::Copy);
        }
        self
    }

    #[must_use]
    pub const fn is_move_in_progress(&self) -> bool {
        self.source_partition_id.is_some()
    }

    /// Action chosen for this cycle, if any
    #[must_use]
    pub fn action(&self) -> Option<OverflowAction> {
        *self.action.lock()
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.action.lock().is_some()
    }

    /// Record `action` unless another action already claimed the shard
    pub fn try_claim(&self, action: OverflowAction) -> bool {
        let mut slot = self.action.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(action);
        true
    }

    /// Release the copy marker so a forced compaction can claim the shard
    pub fn clear_copy(&self) {
        let mut slot = self.action.lock();
        if *slot == Some(OverflowAction::Copy) {
            *slot = None;
        }
    }

    /// Historical view at the snapshot commit time
    #[must_use]
    pub fn view(&self) -> Option<Arc<View>> {
        self.view.lock().clone()
    }

    /// Release the historical view
    pub fn clear_view(&self) {
        self.view.lock().take();
    }
}

/// Claim every shard in `shards` for `action`, or none of them
pub fn try_claim_all(shards: &[&ShardViewMetadata], action: OverflowAction) -> bool {
    let mut ordered: Vec<&ShardViewMetadata> = shards.to_vec();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));
    ordered.dedup_by(|a, b| a.name == b.name);

    let mut slots: Vec<_> = ordered.iter().map(|s| s.action.lock()).collect();
    if slots.iter().any(|slot| slot.is_some()) {
        return false;
    }
    for slot in &mut slots {
        **slot = Some(action);
    }
    true
}

/// Overflow metadata for every shard of one synchronous overflow snapshot
#[derive(Debug)]
pub struct OverflowMetadata {
    last_commit_time: CommitTime,
    views: BTreeMap<ShardName, Arc<ShardViewMetadata>>,
    scores: HashMap<ShardName, Score>,
    partition_counts: HashMap<String, usize>,
    active_count: usize,
}

impl OverflowMetadata {
    #[must_use]
    pub fn new(
        last_commit_time: CommitTime,
        views: Vec<ShardViewMetadata>,
        scores: HashMap<ShardName, Score>,
        partition_counts: HashMap<String, usize>,
    ) -> Self {
        let active_count = scores.values().filter(|s| s.raw > 0).count();
        Self {
            last_commit_time,
            views: views
                .into_iter()
                .map(|v| (v.name.clone(), Arc::new(v)))
                .collect(),
            scores,
            partition_counts,
            active_count,
        }
    }

    /// Open the historical view of every shard in `snapshot` and derive its
    /// statistics
    pub async fn collect(
        store: &dyn ShardStore,
        metadata_index: &dyn MetadataIndex,
        config: &OverflowConfig,
        snapshot: &OverflowSnapshot,
        scores: HashMap<ShardName, Score>,
    ) -> OverflowResult<Self> {
        let mut views = Vec::with_capacity(snapshot.shards.len());
        let mut indices = BTreeSet::new();
        for name in &snapshot.shards {
            indices.insert(name.index().to_string());
            let live = store.shard_definition(name);
            let view = store.open_historical_view(name, snapshot.last_commit_time)?;
            let (range, stats) = match &view {
                Some(view) => (
                    view.range().clone(),
                    ShardStats::compute(view, scores.get(name), config),
                ),
                None => {
                    warn!(
                        "No view for {name} at commit time {}",
                        snapshot.last_commit_time
                    );
                    (
                        live.as_ref().map_or_else(KeyRange::full, |d| d.range.clone()),
                        ShardStats::default(),
                    )
                }
            };
            let (source_partition_id, scatter) = live
                .map(|d| (d.source_partition_id, d.scatter))
                .unwrap_or_default();
            views.push(
                ShardViewMetadata::new(name.clone(), range, view, stats)
                    .with_source_partition_id(source_partition_id)
                    .with_scatter(scatter)
                    .with_copied(snapshot.copied.contains(name)),
            );
        }

        let mut partition_counts = HashMap::new();
        for index in indices {
            match metadata_index.partition_count(&index).await {
                Ok(count) => {
                    partition_counts.insert(index, count);
                }
                Err(e) => warn!("Could not count the partitions of {index}: {e}"),
            }
        }

        Ok(Self::new(
            snapshot.last_commit_time,
            views,
            scores,
            partition_counts,
        ))
    }

    #[must_use]
    pub const fn last_commit_time(&self) -> CommitTime {
        self.last_commit_time
    }

    #[must_use]
    pub fn get(&self, name: &ShardName) -> Option<&Arc<ShardViewMetadata>> {
        self.views.get(name)
    }

    /// Shard metadata in name order
    pub fn views(&self) -> impl Iterator<Item = &Arc<ShardViewMetadata>> {
        self.views.values()
    }

    #[must_use]
    pub fn score(&self, name: &ShardName) -> Option<&Score> {
        self.scores.get(name)
    }

    /// Shards of `index` across the cluster, if known
    #[must_use]
    pub fn partition_count(&self, index: &str) -> Option<usize> {
        self.partition_counts.get(index).copied()
    }

    /// Shards written since the previous cycle
    #[must_use]
    pub const fn active_count(&self) -> usize {
        self.active_count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Release every historical view held by this cycle
    pub fn clear_views(&self) {
        for vmd in self.views.values() {
            vmd.clear_view();
        }
    }
}
