//! Splits
//!
//! A split rebuilds the historical view of a shard into one compact segment
//! per key range. The atomic update registers the new shards, carries over
//! the writes the live journal absorbed since the snapshot, retires the old
//! name and replaces its locator in the metadata index. Balanced splits
//! place separators at evenly spaced live keys. Tail splits cut off the
//! right-most part of the key space for shards that mostly grow by
//! appending. Scatter splits cut the sole shard of an index into many
//! pieces and hand them to several nodes.

use super::moves::{self, MoveResult};
use super::{TaskProgress, TaskState, build_held, discard, historical_view, with_rpc_timeout};
use crate::error::{OverflowError, OverflowResult};
use crate::metadata::ShardViewMetadata;
use crate::node::DataNode;
use bytes::Bytes;
use spanstore_common::{
    ArtifactMetadata, KeyRange, NodeId, PartitionLocator, Result, ShardName, StaleLocatorReason,
};
use spanstore_storage::{ShardDefinition, SourceRef};
use tracing::{info, warn};

/// How the key range of a shard is divided
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SplitKind {
    /// Evenly sized pieces, one per nominal shard size
    Balanced,
    /// A nearly empty right-most piece
    Tail,
    /// `nsplits` pieces handed out round robin over `targets`
    Scatter { nsplits: usize, targets: Vec<NodeId> },
}

/// One shard produced by a split
#[derive(Clone, Debug)]
pub struct SplitOutput {
    pub name: ShardName,
    pub range: KeyRange,
    pub artifact: ArtifactMetadata,
}

/// A committed split
#[derive(Clone, Debug)]
pub struct SplitResult {
    pub name: ShardName,
    pub kind: SplitKind,
    /// New shards in key order
    pub splits: Vec<SplitOutput>,
    /// Moves of new shards that committed
    pub moves: Vec<MoveResult>,
    /// New shards whose move failed; they stay on this node
    pub failed_moves: Vec<ShardName>,
}

/// Separators that cut `keys` into `nsplits` pieces holding about the same
/// number of keys. Fewer pieces are produced when there are too few keys.
#[must_use]
pub fn balanced_separators(keys: &[Bytes], nsplits: usize) -> Vec<Bytes> {
    let n = nsplits.min(keys.len());
    if n < 2 {
        return Vec::new();
    }
    (1..n).map(|i| keys[i * keys.len() / n].clone()).collect()
}

/// Separator for a tail split of `keys`.
///
/// The keys are laid out as a tree with `branching_factor` keys per leaf.
/// The separator is the first key under the right-most node directly above
/// the leaves, or the first key of the right-most leaf when that node also
/// covers the first key.
#[must_use]
pub fn tail_separator(keys: &[Bytes], branching_factor: usize) -> Option<Bytes> {
    if keys.len() < 2 {
        return None;
    }
    let leaf = branching_factor.max(2);
    let last = keys.len() - 1;
    let mut at = last / (leaf * leaf) * (leaf * leaf);
    if at == 0 {
        at = last / leaf * leaf;
    }
    if at == 0 {
        at = last;
    }
    Some(keys[at].clone())
}

/// Number of balanced pieces for a shard of the given percent of split
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn balanced_split_count(percent_of_split: f64) -> usize {
    if percent_of_split.is_finite() && percent_of_split > 2.0 {
        percent_of_split.ceil() as usize
    } else {
        2
    }
}

/// Key ranges of the pieces of `range` cut at `separators`
fn split_ranges(range: &KeyRange, separators: &[Bytes]) -> Vec<KeyRange> {
    let mut ranges = Vec::with_capacity(separators.len() + 1);
    let mut left = range.left.clone();
    for separator in separators {
        ranges.push(KeyRange::new(left, Some(separator.clone())));
        left = separator.clone();
    }
    ranges.push(KeyRange::new(left, range.right.clone()));
    ranges
}

pub(crate) async fn run(
    node: &DataNode,
    vmd: &ShardViewMetadata,
    kind: SplitKind,
    move_target: Option<NodeId>,
    progress: &TaskProgress,
) -> OverflowResult<SplitResult> {
    if vmd.is_move_in_progress() {
        return Err(OverflowError::MoveInProgress(vmd.name.clone()));
    }
    if move_target == Some(node.node_id) {
        return Err(OverflowError::MoveToSelf(vmd.name.clone()));
    }

    let view = historical_view(vmd)?;
    let keys = view.live_keys();
    let separators = match &kind {
        SplitKind::Balanced => {
            balanced_separators(&keys, balanced_split_count(vmd.stats.percent_of_split))
        }
        SplitKind::Tail => tail_separator(&keys, node.config.branching_factor)
            .into_iter()
            .collect(),
        SplitKind::Scatter { nsplits, .. } => balanced_separators(&keys, *nsplits),
    };
    if separators.is_empty() {
        return Err(OverflowError::split_refused(
            &vmd.name,
            format!("{} live keys", keys.len()),
        ));
    }

    let index = vmd.name.index();
    let mut hold = node.retention.hold();
    let mut splits: Vec<SplitOutput> = Vec::with_capacity(separators.len() + 1);
    for range in split_ranges(view.range(), &separators) {
        let built = async {
            let pid = with_rpc_timeout(
                node,
                "allocate partition id",
                node.metadata_index.next_partition_id(index),
            )
            .await?;
            let artifact = build_held(node, &mut hold, &view, true, &range)?;
            Ok::<_, spanstore_common::Error>(SplitOutput {
                name: ShardName::new(index, pid),
                range,
                artifact,
            })
        }
        .await;
        match built {
            Ok(split) => splits.push(split),
            Err(e) => {
                discard(node, &splits.iter().map(|s| &s.artifact).collect::<Vec<_>>());
                return Err(e.into());
            }
        }
    }
    progress.advance(TaskState::HistoricalReadDone);

    commit(node, vmd, &splits, progress).await?;
    info!(
        "Split {} into {}",
        vmd.name,
        splits
            .iter()
            .map(|s| format!("{} {}", s.name, s.range))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut result = SplitResult {
        name: vmd.name.clone(),
        kind,
        splits,
        moves: Vec::new(),
        failed_moves: Vec::new(),
    };
    for (i, target) in movers(&result, move_target, node.node_id) {
        let split = &result.splits[i];
        let covered = [SourceRef::Segment(split.artifact.id)];
        match moves::relocate(node, &split.name, target, &split.artifact, &covered, &mut hold, progress)
            .await
        {
            Ok(moved) => result.moves.push(moved),
            Err(e) => {
                warn!("Move of {} to {target} after split failed: {e}", split.name);
                result.failed_moves.push(split.name.clone());
            }
        }
    }
    Ok(result)
}

/// New shards to move once the split has committed
fn movers(result: &SplitResult, move_target: Option<NodeId>, this: NodeId) -> Vec<(usize, NodeId)> {
    match (&result.kind, move_target) {
        (SplitKind::Scatter { targets, .. }, _) if !targets.is_empty() => (0..result.splits.len())
            .map(|i| (i, targets[i % targets.len()]))
            .filter(|(_, target)| *target != this)
            .collect(),
        (SplitKind::Tail, Some(target)) => vec![(result.splits.len() - 1, target)],
        (SplitKind::Balanced, Some(target)) => result
            .splits
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.artifact.byte_len)
            .map(|(i, _)| (i, target))
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

async fn commit(
    node: &DataNode,
    vmd: &ShardViewMetadata,
    splits: &[SplitOutput],
    progress: &TaskProgress,
) -> OverflowResult<()> {
    let mut names = vec![vmd.name.clone()];
    names.extend(splits.iter().map(|s| s.name.clone()));
    let _locks = node.locks.lock(&names).await;
    let artifacts: Vec<&ArtifactMetadata> = splits.iter().map(|s| &s.artifact).collect();
    if let Err(e) = progress.begin_commit() {
        discard(node, &artifacts);
        return Err(e.into());
    }

    let Some(live) = node.store.shard_definition(&vmd.name) else {
        discard(node, &artifacts);
        return Err(node.stale.not_found_error(&vmd.name).into());
    };

    let mut registered = Vec::with_capacity(splits.len());
    if let Err(e) = register_splits(node, &live, splits, &mut registered) {
        unregister(node, &registered);
        discard(node, &artifacts);
        return Err(e.into());
    }

    let index = vmd.name.index();
    let old = PartitionLocator::new(vmd.name.partition_id(), node.node_id, live.range.clone());
    let new: Vec<PartitionLocator> = splits
        .iter()
        .map(|s| PartitionLocator::new(s.name.partition_id(), node.node_id, s.range.clone()))
        .collect();
    let updated = with_rpc_timeout(
        node,
        "split update",
        node.metadata_index.split_shard(index, &old, &new),
    )
    .await;
    if let Err(e) = updated {
        if !is_applied(node, index, &new[0]).await {
            unregister(node, &registered);
            discard(node, &artifacts);
            return Err(e.into());
        }
        warn!("Split update of {} reported {e} but was applied", vmd.name);
    }

    super::retire(node, &vmd.name, StaleLocatorReason::Split);
    Ok(())
}

fn register_splits(
    node: &DataNode,
    live: &ShardDefinition,
    splits: &[SplitOutput],
    registered: &mut Vec<ShardName>,
) -> Result<()> {
    let journal = node.store.live_journal();
    for split in splits {
        let definition = ShardDefinition {
            name: split.name.clone(),
            range: split.range.clone(),
            sources: vec![
                SourceRef::Journal(journal),
                SourceRef::Segment(split.artifact.id),
            ],
            source_partition_id: None,
            scatter: live.scatter.clone(),
        };
        node.store.register_shard(definition, None)?;
        registered.push(split.name.clone());
        node.store
            .copy_live_writes(&live.name, &split.name, &split.range)?;
    }
    Ok(())
}

fn unregister(node: &DataNode, names: &[ShardName]) {
    for name in names {
        if let Err(e) = node.store.drop_shard(name) {
            warn!("Could not drop {name}: {e}");
        }
    }
}

/// True if the metadata index already maps the range of `locator` to it
pub(crate) async fn is_applied(node: &DataNode, index: &str, locator: &PartitionLocator) -> bool {
    with_rpc_timeout(
        node,
        "locate",
        node.metadata_index.locate(index, &locator.range.left),
    )
    .await
    .is_ok_and(|current| current == *locator)
}
