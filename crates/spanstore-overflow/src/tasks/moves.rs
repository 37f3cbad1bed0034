//! Moves
//!
//! A move hands a shard to another node under a new name. The source
//! compacts the historical view into one segment, then under the shard lock
//! builds the writes its live journal absorbed since the snapshot into a
//! second segment and asks the target to receive the shard. The target
//! pulls both segments, registers the shard and points the metadata index
//! at it. Only then does the source retire the old name.
//!
//! When the request to the target fails, the source asks the target whether
//! it registered the shard anyway. A registered shard means the move
//! happened; the metadata index is brought in line if needed and the source
//! proceeds as on success. Otherwise any metadata change is undone and the
//! shard stays on the source.

use super::{
    TaskProgress, TaskState, build_held, discard, historical_view, with_rpc_timeout,
};
use crate::error::{OverflowError, OverflowResult};
use crate::metadata::ShardViewMetadata;
use crate::node::DataNode;
use async_trait::async_trait;
use spanstore_client::{PeerNode, ReceiveShardRequest};
use spanstore_common::{
    ArtifactMetadata, Error, NodeId, PartitionLocator, Result, ShardName, StaleLocatorReason,
};
use spanstore_storage::{RetentionHold, ShardDefinition, SourceRef};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

/// A committed move
#[derive(Clone, Debug)]
pub struct MoveResult {
    pub name: ShardName,
    /// Name of the shard on the target
    pub new_name: ShardName,
    pub target: NodeId,
    /// Compacted history shipped to the target
    pub history: ArtifactMetadata,
    /// Writes buffered since the snapshot, shipped to the target
    pub buffered: ArtifactMetadata,
}

pub(crate) async fn run(
    node: &DataNode,
    vmd: &ShardViewMetadata,
    target: NodeId,
    progress: &TaskProgress,
) -> OverflowResult<MoveResult> {
    if vmd.is_move_in_progress() {
        return Err(OverflowError::MoveInProgress(vmd.name.clone()));
    }
    if target == node.node_id {
        return Err(OverflowError::MoveToSelf(vmd.name.clone()));
    }

    let view = historical_view(vmd)?;
    let mut hold = node.retention.hold();
    let history = build_held(node, &mut hold, &view, true, view.range())?;
    progress.advance(TaskState::HistoricalReadDone);

    let covered = view.source_refs();
    let moved = relocate(
        node,
        &vmd.name,
        target,
        &history,
        &covered,
        &mut hold,
        progress,
    )
    .await;
    if moved.is_err() {
        discard(node, &[&history]);
    }
    moved
}

/// Atomic update of a move. `history` must capture every source of the live
/// definition except the live journal; `covered` lists those sources.
pub(crate) async fn relocate(
    node: &DataNode,
    name: &ShardName,
    target: NodeId,
    history: &ArtifactMetadata,
    covered: &[SourceRef],
    hold: &mut RetentionHold,
    progress: &TaskProgress,
) -> OverflowResult<MoveResult> {
    if target == node.node_id {
        return Err(OverflowError::MoveToSelf(name.clone()));
    }
    let peer = node
        .directory
        .peer(&target)
        .ok_or_else(|| Error::NodeNotFound(target.to_string()))?;
    let index = name.index();
    let new_pid = with_rpc_timeout(
        node,
        "allocate partition id",
        node.metadata_index.next_partition_id(index),
    )
    .await?;
    let new_name = ShardName::new(index, new_pid);

    let _locks = node.locks.lock(std::slice::from_ref(name)).await;
    progress.begin_commit()?;

    let live = node
        .store
        .shard_definition(name)
        .ok_or_else(|| node.stale.not_found_error(name))?;
    if live.is_move_in_progress() {
        return Err(OverflowError::MoveInProgress(name.clone()));
    }
    if !live.sources[1..].iter().all(|s| covered.contains(s)) {
        return Err(OverflowError::ViewChanged(name.clone()));
    }

    let buffered_view = node.store.live_journal_view(name)?;
    let buffered = build_held(node, hold, &buffered_view, false, &live.range)?;

    let request = ReceiveShardRequest {
        source_node: node.node_id,
        source_addr: node.transfer_addr,
        old_locator: PartitionLocator::new(name.partition_id(), node.node_id, live.range.clone()),
        new_name: new_name.clone(),
        scatter: live.scatter.clone(),
        history: history.clone(),
        buffered: buffered.clone(),
    };
    let old_locator = request.old_locator.clone();
    let new_locator = request.new_locator(target);

    let received = with_rpc_timeout(node, "receive shard", peer.receive_shard(request)).await;
    if let Err(cause) = received {
        if let Err(e) =
            reconcile_move(node, peer.as_ref(), &new_name, &old_locator, &new_locator, cause).await
        {
            discard(node, &[&buffered]);
            return Err(e);
        }
    }

    super::retire(node, name, StaleLocatorReason::Move);
    info!("Moved {name} to {new_name} on {target}");

    if let Err(e) = with_rpc_timeout(node, "finish receive", peer.finish_receive(&new_name)).await
    {
        warn!("Could not finish the move of {new_name} on {target}: {e}");
    }

    Ok(MoveResult {
        name: name.clone(),
        new_name,
        target,
        history: history.clone(),
        buffered,
    })
}

/// Decide the outcome of a move whose request to the target failed with
/// `cause`. Returns `Ok` when the target registered the shard, after making
/// sure the metadata index points at it. Otherwise undoes any metadata
/// change and returns the cause. Safe to call repeatedly.
pub async fn reconcile_move(
    node: &DataNode,
    peer: &dyn PeerNode,
    new_name: &ShardName,
    old: &PartitionLocator,
    new: &PartitionLocator,
    cause: Error,
) -> OverflowResult<()> {
    let index = new_name.index();
    let registered = with_rpc_timeout(
        node,
        "check registration",
        peer.is_shard_registered(new_name),
    )
    .await;
    let current = with_rpc_timeout(
        node,
        "locate",
        node.metadata_index.locate(index, &old.range.left),
    )
    .await;

    if matches!(registered, Ok(true)) {
        info!("Move to {new_name} succeeded despite: {cause}");
        if current? == *old {
            with_rpc_timeout(
                node,
                "move update",
                node.metadata_index.move_shard(index, old, new),
            )
            .await?;
        }
        return Ok(());
    }

    if matches!(&current, Ok(locator) if locator == new) {
        warn!("Reverting the metadata index entry for {new_name}");
        if let Err(e) = with_rpc_timeout(
            node,
            "move update",
            node.metadata_index.move_shard(index, new, old),
        )
        .await
        {
            error!("Could not revert the metadata index entry for {new_name}: {e}");
        }
    }
    Err(cause.into())
}

impl DataNode {
    /// Take over a shard moving from another node
    pub async fn receive_shard(&self, request: ReceiveShardRequest) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ShuttingDown);
        }
        let mut hold = self.retention.hold();
        let mut installed: Vec<ArtifactMetadata> = Vec::with_capacity(2);
        for artifact in [&request.buffered, &request.history] {
            let fetched = with_rpc_timeout(
                self,
                "fetch artifact",
                self.transfer.fetch(request.source_addr, artifact.id),
            )
            .await
            .and_then(|payload| self.store.install_artifact(payload));
            match fetched {
                Ok(metadata) => {
                    hold.adopt(metadata.id);
                    installed.push(metadata);
                }
                Err(e) => {
                    discard(self, &installed.iter().collect::<Vec<_>>());
                    return Err(e);
                }
            }
        }

        let new_locator = request.new_locator(self.node_id);
        let name = request.new_name.clone();
        let _locks = self.locks.lock(std::slice::from_ref(&name)).await;

        let mut sources = vec![SourceRef::Journal(self.store.live_journal())];
        sources.extend(installed.iter().map(|a| SourceRef::Segment(a.id)));
        let definition = ShardDefinition {
            name: name.clone(),
            range: request.old_locator.range.clone(),
            sources,
            source_partition_id: Some(request.old_locator.partition_id),
            scatter: request.scatter.clone(),
        };
        if let Err(e) = self.store.register_shard(definition, None) {
            discard(self, &installed.iter().collect::<Vec<_>>());
            return Err(e);
        }

        let updated = with_rpc_timeout(
            self,
            "move update",
            self.metadata_index
                .move_shard(name.index(), &request.old_locator, &new_locator),
        )
        .await;
        if let Err(e) = updated {
            if let Err(drop_err) = self.store.drop_shard(&name) {
                warn!("Could not drop {name}: {drop_err}");
            }
            discard(self, &installed.iter().collect::<Vec<_>>());
            return Err(e);
        }

        self.counters.receive.fetch_add(1, Ordering::Relaxed);
        info!(
            "Received {name} from {} (partition {})",
            request.source_node, request.old_locator.partition_id
        );
        Ok(())
    }

    #[must_use]
    pub fn is_shard_registered(&self, name: &ShardName) -> bool {
        self.store.shard_definition(name).is_some()
    }

    /// Clear the in-progress marker of a received shard
    pub async fn finish_receive(&self, name: &ShardName) -> Result<()> {
        let _locks = self.locks.lock(std::slice::from_ref(name)).await;
        let mut definition = self
            .store
            .shard_definition(name)
            .ok_or_else(|| self.stale.not_found_error(name))?;
        if definition.source_partition_id.take().is_some() {
            self.store.replace_definition(definition)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerNode for DataNode {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn transfer_addr(&self) -> SocketAddr {
        self.transfer_addr
    }

    async fn receive_shard(&self, request: ReceiveShardRequest) -> Result<()> {
        Self::receive_shard(self, request).await
    }

    async fn is_shard_registered(&self, name: &ShardName) -> Result<bool> {
        Ok(Self::is_shard_registered(self, name))
    }

    async fn finish_receive(&self, name: &ShardName) -> Result<()> {
        Self::finish_receive(self, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use bytes::Bytes;
    use spanstore_client::MetadataIndex;
    use spanstore_storage::ShardStore;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    /// Delivers the request and then reports a timeout, as if the reply
    /// was lost
    struct LostReplyPeer {
        inner: Arc<DataNode>,
        lose_reply: AtomicBool,
    }

    #[async_trait]
    impl PeerNode for LostReplyPeer {
        fn node_id(&self) -> NodeId {
            self.inner.id()
        }

        fn transfer_addr(&self) -> SocketAddr {
            self.inner.addr()
        }

        async fn receive_shard(&self, request: ReceiveShardRequest) -> Result<()> {
            self.inner.receive_shard(request).await?;
            if self.lose_reply.load(Ordering::SeqCst) {
                return Err(Error::Timeout("receive shard".into()));
            }
            Ok(())
        }

        async fn is_shard_registered(&self, name: &ShardName) -> Result<bool> {
            Ok(self.inner.is_shard_registered(name))
        }

        async fn finish_receive(&self, name: &ShardName) -> Result<()> {
            self.inner.finish_receive(name).await
        }
    }

    async fn populated(cluster: &LocalCluster) -> ShardName {
        let name = cluster
            .create_index("idx", 0, &[Bytes::from_static(b"m")])
            .await
            .unwrap()[0]
            .clone();
        for key in ["a", "b", "c"] {
            cluster
                .node(0)
                .write(&name, Bytes::from(key), Bytes::from_static(b"v"))
                .await
                .unwrap();
        }
        name
    }

    #[tokio::test]
    async fn test_move_hands_over_history_and_buffered_writes() {
        let cluster = LocalCluster::for_tests(2);
        let name = populated(&cluster).await;
        let metadata = cluster.snapshot(0).await;
        cluster
            .node(0)
            .write(&name, Bytes::from_static(b"d"), Bytes::from_static(b"late"))
            .await
            .unwrap();

        let vmd = metadata.get(&name).unwrap();
        let target = cluster.node(1).id();
        let moved = run(cluster.node(0), vmd, target, &TaskProgress::new())
            .await
            .unwrap();

        let target_node = cluster.node(1);
        assert_eq!(target_node.read(&moved.new_name, b"a").unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(
            target_node.read(&moved.new_name, b"d").unwrap(),
            Some(Bytes::from_static(b"late"))
        );
        // the move has cut over on the target
        let definition = cluster.store(1).shard_definition(&moved.new_name).unwrap();
        assert!(!definition.is_move_in_progress());

        let err = cluster
            .node(0)
            .write(&name, Bytes::from_static(b"e"), Bytes::from_static(b"v"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StaleLocator {
                reason: StaleLocatorReason::Move,
                ..
            }
        ));
        let locator = cluster.metadata_index.locators("idx")[0].clone();
        assert_eq!(locator.node, target);
        assert_eq!(cluster.metadata_index.move_count(), 1);
    }

    #[tokio::test]
    async fn test_move_to_self_is_refused() {
        let cluster = LocalCluster::for_tests(1);
        let name = populated(&cluster).await;
        let metadata = cluster.snapshot(0).await;
        let vmd = metadata.get(&name).unwrap();
        let err = run(cluster.node(0), vmd, cluster.node(0).id(), &TaskProgress::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OverflowError::MoveToSelf(_)));
        assert_eq!(cluster.metadata_index.move_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_move_discards_history() {
        let cluster = LocalCluster::for_tests(2);
        let name = populated(&cluster).await;
        let metadata = cluster.snapshot(0).await;
        let vmd = metadata.get(&name).unwrap();

        let progress = TaskProgress::new();
        assert!(progress.cancel());
        let err = run(cluster.node(0), vmd, cluster.node(1).id(), &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, OverflowError::Common(Error::Cancelled)));
        assert_eq!(cluster.store(0).segment_count(), 0);
        assert!(cluster.store(0).shard_definition(&name).is_some());
        assert!(cluster.store(1).shard_names().is_empty());
        assert_eq!(cluster.metadata_index.move_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_transfer_keeps_shard_on_source() {
        let cluster = LocalCluster::for_tests(2);
        let name = populated(&cluster).await;
        let metadata = cluster.snapshot(0).await;
        let vmd = metadata.get(&name).unwrap();

        cluster.transfer.set_fail_fetches(true);
        let err = run(cluster.node(0), vmd, cluster.node(1).id(), &TaskProgress::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OverflowError::Common(Error::Transfer(_))));

        assert!(cluster.node(0).read(&name, b"a").unwrap().is_some());
        assert!(cluster.store(1).shard_names().is_empty());
        assert_eq!(cluster.metadata_index.locators("idx")[0].node, cluster.node(0).id());
        assert_eq!(cluster.metadata_index.move_count(), 0);
    }

    #[tokio::test]
    async fn test_lost_reply_counts_as_success_once() {
        let cluster = LocalCluster::for_tests(2);
        let name = populated(&cluster).await;
        let flaky = Arc::new(LostReplyPeer {
            inner: Arc::clone(cluster.node(1)),
            lose_reply: AtomicBool::new(true),
        });
        cluster.directory.register(flaky.clone());

        let metadata = cluster.snapshot(0).await;
        let vmd = metadata.get(&name).unwrap();
        let moved = run(cluster.node(0), vmd, cluster.node(1).id(), &TaskProgress::new())
            .await
            .unwrap();
        assert_eq!(cluster.metadata_index.move_count(), 1);
        assert!(cluster.store(0).shard_definition(&name).is_none());

        // checking again finds the move done and applies nothing twice
        let old = PartitionLocator::new(
            name.partition_id(),
            cluster.node(0).id(),
            cluster.metadata_index.locators("idx")[0].range.clone(),
        );
        let new = PartitionLocator::new(
            moved.new_name.partition_id(),
            cluster.node(1).id(),
            old.range.clone(),
        );
        reconcile_move(
            cluster.node(0),
            flaky.as_ref(),
            &moved.new_name,
            &old,
            &new,
            Error::Timeout("receive shard".into()),
        )
        .await
        .unwrap();
        assert_eq!(cluster.metadata_index.move_count(), 1);
        assert_eq!(cluster.metadata_index.locators("idx")[0], new);
    }

    #[tokio::test]
    async fn test_reconcile_reverts_unregistered_target() {
        let cluster = LocalCluster::for_tests(2);
        let name = populated(&cluster).await;
        let old = cluster.metadata_index.locators("idx")[0].clone();
        let new_name = ShardName::new("idx", 42);
        let new = PartitionLocator::new(42, cluster.node(1).id(), old.range.clone());

        // the metadata index moved but the target never registered the shard
        cluster
            .metadata_index
            .move_shard("idx", &old, &new)
            .await
            .unwrap();
        let peer = cluster.node(1).clone();
        let err = reconcile_move(
            cluster.node(0),
            peer.as_ref(),
            &new_name,
            &old,
            &new,
            Error::Timeout("receive shard".into()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OverflowError::Common(Error::Timeout(_))));
        assert_eq!(cluster.metadata_index.locators("idx")[0], old);
        assert!(cluster.store(0).shard_definition(&name).is_some());
    }
}
