//! Joins
//!
//! A join fuses adjacent sibling shards into one new shard. The historical
//! tuples of every sibling are merged in memory and seed the live journal
//! of the new shard; writes absorbed since the snapshot are copied on top.

use super::{TaskProgress, TaskState, historical_view, with_rpc_timeout};
use crate::error::{OverflowError, OverflowResult};
use crate::metadata::ShardViewMetadata;
use crate::node::DataNode;
use crate::tasks::split::is_applied;
use spanstore_common::{KeyRange, PartitionLocator, ShardName, StaleLocatorReason};
use spanstore_storage::{ShardDefinition, Tree};
use tracing::{info, warn};

/// A committed join
#[derive(Clone, Debug)]
pub struct JoinResult {
    /// Retired shards in key order
    pub names: Vec<ShardName>,
    pub joined: ShardName,
    pub range: KeyRange,
    /// Historical tuples carried into the joined shard
    pub tuples: u64,
}

/// Fail unless `shards` are siblings of one index listed in key order
fn check_adjacent(shards: &[&ShardViewMetadata]) -> OverflowResult<()> {
    for pair in shards.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        if left.name.index() != right.name.index() || !left.range.is_left_sibling_of(&right.range)
        {
            return Err(OverflowError::NotAdjacent {
                left: left.name.clone(),
                right: right.name.clone(),
            });
        }
    }
    Ok(())
}

pub(crate) async fn run(
    node: &DataNode,
    shards: &[&ShardViewMetadata],
    progress: &TaskProgress,
) -> OverflowResult<JoinResult> {
    let (Some(first), Some(last)) = (shards.first(), shards.last()) else {
        return Err(spanstore_common::Error::invalid_argument("nothing to join").into());
    };
    if let Some(landing) = shards.iter().find(|vmd| vmd.is_move_in_progress()) {
        return Err(OverflowError::MoveInProgress(landing.name.clone()));
    }
    check_adjacent(shards)?;

    let range = KeyRange::new(first.range.left.clone(), last.range.right.clone());
    let mut seed = Tree::new();
    let mut tuples = 0;
    for vmd in shards {
        let view = historical_view(vmd)?;
        tuples += view.range_copy(&mut seed, &vmd.range.left, vmd.range.right.as_deref(), false);
    }
    let index = first.name.index();
    let pid = with_rpc_timeout(
        node,
        "allocate partition id",
        node.metadata_index.next_partition_id(index),
    )
    .await?;
    let joined = ShardName::new(index, pid);
    progress.advance(TaskState::HistoricalReadDone);

    let names: Vec<ShardName> = shards.iter().map(|vmd| vmd.name.clone()).collect();
    let mut locked = names.clone();
    locked.push(joined.clone());
    let _locks = node.locks.lock(&locked).await;
    progress.begin_commit()?;

    let mut old = Vec::with_capacity(shards.len());
    let mut scatter = None;
    for name in &names {
        let live = node
            .store
            .shard_definition(name)
            .ok_or_else(|| node.stale.not_found_error(name))?;
        old.push(PartitionLocator::new(
            name.partition_id(),
            node.node_id,
            live.range.clone(),
        ));
        scatter.get_or_insert(live.scatter);
    }

    let mut definition = ShardDefinition::on_journal(joined.clone(), range.clone(), node.store.live_journal());
    definition.scatter = scatter.unwrap_or_default();
    node.store.register_shard(definition, Some(seed))?;
    let copied = names.iter().try_for_each(|name| {
        node.store
            .copy_live_writes(name, &joined, &range)
            .map(|_| ())
    });
    if let Err(e) = copied {
        drop_joined(node, &joined);
        return Err(e.into());
    }

    let new = PartitionLocator::new(pid, node.node_id, range.clone());
    let updated = with_rpc_timeout(
        node,
        "join update",
        node.metadata_index.join_shards(index, &old, &new),
    )
    .await;
    if let Err(e) = updated {
        if !is_applied(node, index, &new).await {
            drop_joined(node, &joined);
            return Err(e.into());
        }
        warn!("Join update of {joined} reported {e} but was applied");
    }

    for name in &names {
        super::retire(node, name, StaleLocatorReason::Join);
    }
    info!("Joined {names:?} into {joined} {range}");
    Ok(JoinResult {
        names,
        joined,
        range,
        tuples,
    })
}

fn drop_joined(node: &DataNode, joined: &ShardName) {
    if let Err(e) = node.store.drop_shard(joined) {
        warn!("Could not drop {joined}: {e}");
    }
}
