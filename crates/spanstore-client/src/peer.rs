//! Peer data node client and node directory

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use spanstore_common::{
    ArtifactMetadata, NodeId, PartitionLocator, Result, ScatterSplitConfig, ShardName,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Request asking a target node to take over a shard
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiveShardRequest {
    /// Node the shard is moving away from
    pub source_node: NodeId,
    /// Transfer address serving the artifacts below
    pub source_addr: SocketAddr,
    /// Locator of the shard on the source node
    pub old_locator: PartitionLocator,
    /// Name the shard will have on the target
    pub new_name: ShardName,
    pub scatter: ScatterSplitConfig,
    /// Compacted history as of the overflow snapshot
    pub history: ArtifactMetadata,
    /// Writes buffered on the source's live journal since the snapshot
    pub buffered: ArtifactMetadata,
}

impl ReceiveShardRequest {
    /// Locator of the shard once it lives on `target`
    #[must_use]
    pub fn new_locator(&self, target: NodeId) -> PartitionLocator {
        PartitionLocator::new(
            self.new_name.partition_id(),
            target,
            self.old_locator.range.clone(),
        )
    }
}

/// Client of another data node
#[async_trait]
pub trait PeerNode: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Address of the node's resource transfer service
    fn transfer_addr(&self) -> SocketAddr;

    /// Fetch the artifacts of a moving shard, register it and point the
    /// metadata index at it
    async fn receive_shard(&self, request: ReceiveShardRequest) -> Result<()>;

    /// True if the node has a live definition for `name`
    async fn is_shard_registered(&self, name: &ShardName) -> Result<bool>;

    /// Clear the in-progress move marker of a received shard
    async fn finish_receive(&self, name: &ShardName) -> Result<()>;
}

/// Resolves node ids to peer clients
pub trait NodeDirectory: Send + Sync {
    /// Client for `node`, if known
    fn peer(&self, node: &NodeId) -> Option<Arc<dyn PeerNode>>;

    /// All known nodes in id order
    fn nodes(&self) -> Vec<NodeId>;
}

/// Directory of nodes registered explicitly
#[derive(Default)]
pub struct StaticDirectory {
    peers: RwLock<BTreeMap<NodeId, Arc<dyn PeerNode>>>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: Arc<dyn PeerNode>) {
        self.peers.write().insert(peer.node_id(), peer);
    }

    pub fn deregister(&self, node: &NodeId) {
        self.peers.write().remove(node);
    }
}

impl NodeDirectory for StaticDirectory {
    fn peer(&self, node: &NodeId) -> Option<Arc<dyn PeerNode>> {
        self.peers.read().get(node).cloned()
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.peers.read().keys().copied().collect()
    }
}
