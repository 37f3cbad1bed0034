//! In-process cluster
//!
//! Wires several data nodes to one metadata index, load balancer, transfer
//! registry and node directory. Used by the simulator and by tests.

use crate::host::StaticHostCounters;
use crate::node::{DataNode, DataNodeBuilder};
use async_trait::async_trait;
use bytes::Bytes;
use spanstore_client::{
    LocalTransfer, MemoryMetadataIndex, PeerNode, ReceiveShardRequest, StaticDirectory,
    StaticLoadBalancer,
};
use spanstore_common::{
    Error, NodeId, OverflowConfig, Result, ScatterSplitConfig, ShardName,
};
use spanstore_storage::{MemoryStore, RetentionSet, StaleLocatorCache};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::info;

const BASE_PORT: u16 = 7000;

/// Directory entry reaching a node of this process
struct LocalPeer {
    node_id: NodeId,
    addr: SocketAddr,
    node: Weak<DataNode>,
}

impl LocalPeer {
    fn node(&self) -> Result<Arc<DataNode>> {
        self.node
            .upgrade()
            .ok_or_else(|| Error::ChannelClosed(format!("node {} is gone", self.node_id)))
    }
}

#[async_trait]
impl PeerNode for LocalPeer {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn transfer_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn receive_shard(&self, request: ReceiveShardRequest) -> Result<()> {
        self.node()?.receive_shard(request).await
    }

    async fn is_shard_registered(&self, name: &ShardName) -> Result<bool> {
        Ok(self.node()?.is_shard_registered(name))
    }

    async fn finish_receive(&self, name: &ShardName) -> Result<()> {
        self.node()?.finish_receive(name).await
    }
}

/// Data nodes sharing the cluster services of one process
pub struct LocalCluster {
    pub metadata_index: Arc<MemoryMetadataIndex>,
    pub load_balancer: Arc<StaticLoadBalancer>,
    pub transfer: Arc<LocalTransfer>,
    pub directory: Arc<StaticDirectory>,
    nodes: Vec<Arc<DataNode>>,
    stores: Vec<Arc<MemoryStore>>,
    hosts: Vec<Arc<StaticHostCounters>>,
}

impl LocalCluster {
    /// Start `n` nodes. Each node keeps its segments under its own
    /// directory below `data_dir` and rotates its journal once it holds
    /// `max_journal_bytes`.
    pub fn new(
        n: usize,
        config: OverflowConfig,
        data_dir: &Path,
        max_journal_bytes: u64,
    ) -> Result<Self> {
        let metadata_index = Arc::new(MemoryMetadataIndex::new());
        let load_balancer = Arc::new(StaticLoadBalancer::default());
        let transfer = Arc::new(LocalTransfer::new());
        let directory = Arc::new(StaticDirectory::new());

        let mut nodes = Vec::with_capacity(n);
        let mut stores = Vec::with_capacity(n);
        let mut hosts = Vec::with_capacity(n);
        for i in 0..n {
            let port = u16::try_from(i)
                .ok()
                .and_then(|i| BASE_PORT.checked_add(i))
                .ok_or_else(|| Error::Configuration(format!("too many nodes: {n}")))?;
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            let name = format!("node-{i}");
            let retention = Arc::new(RetentionSet::new());
            let stale = Arc::new(StaleLocatorCache::new(config.stale_locator_capacity));
            let store = Arc::new(MemoryStore::new(
                data_dir.join(&name),
                max_journal_bytes,
                Arc::clone(&retention),
                Arc::clone(&stale),
            ));
            let host = Arc::new(StaticHostCounters::default());

            let node = DataNodeBuilder::new(config.clone(), store.clone(), retention, stale)
                .name(name.as_str())
                .transfer_addr(addr)
                .metadata_index(metadata_index.clone())
                .transfer(transfer.clone())
                .directory(directory.clone())
                .load_balancer(load_balancer.clone())
                .host(host.clone())
                .build()?;

            transfer.serve(addr, store.clone());
            directory.register(Arc::new(LocalPeer {
                node_id: node.id(),
                addr,
                node: Arc::downgrade(&node),
            }));
            info!("Started {name} ({}) on {addr}", node.id());
            nodes.push(node);
            stores.push(store);
            hosts.push(host);
        }

        Ok(Self {
            metadata_index,
            load_balancer,
            transfer,
            directory,
            nodes,
            stores,
            hosts,
        })
    }

    /// # Panics
    ///
    /// Panics if `i` is not a node of this cluster.
    #[must_use]
    pub fn node(&self, i: usize) -> &Arc<DataNode> {
        &self.nodes[i]
    }

    /// # Panics
    ///
    /// Panics if `i` is not a node of this cluster.
    #[must_use]
    pub fn store(&self, i: usize) -> &Arc<MemoryStore> {
        &self.stores[i]
    }

    /// # Panics
    ///
    /// Panics if `i` is not a node of this cluster.
    #[must_use]
    pub fn host(&self, i: usize) -> &Arc<StaticHostCounters> {
        &self.hosts[i]
    }

    #[must_use]
    pub fn nodes(&self) -> &[Arc<DataNode>] {
        &self.nodes
    }

    /// Create a scale-out index pre-split at `separators` with every shard
    /// on node `node`. Returns the shard names in key order.
    pub async fn create_index(
        &self,
        index: &str,
        node: usize,
        separators: &[Bytes],
    ) -> Result<Vec<ShardName>> {
        self.create_index_with(index, node, separators, ScatterSplitConfig::default())
            .await
    }

    /// [`Self::create_index`] with explicit scatter split settings
    pub async fn create_index_with(
        &self,
        index: &str,
        node: usize,
        separators: &[Bytes],
        scatter: ScatterSplitConfig,
    ) -> Result<Vec<ShardName>> {
        let owner = self
            .nodes
            .get(node)
            .ok_or_else(|| Error::NodeNotFound(format!("node-{node}")))?;
        let locators = self
            .metadata_index
            .create_index_with_splits(index, owner.id(), separators)?;
        let mut names = Vec::with_capacity(locators.len());
        for locator in locators {
            let name = ShardName::new(index, locator.partition_id);
            owner.create_shard(name.clone(), locator.range, scatter.clone())?;
            names.push(name);
        }
        Ok(names)
    }

    /// Stop every node
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
            self.transfer.shutdown(&node.addr());
        }
    }
}

#[cfg(test)]
impl LocalCluster {
    /// Nodes that build every buffered write instead of copying it
    pub fn for_tests(n: usize) -> Self {
        let config = OverflowConfig {
            copy_index_threshold: 0,
            ..OverflowConfig::default()
        };
        Self::new(n, config, &std::env::temp_dir().join("spanstore-tests"), 1 << 20).unwrap()
    }

    /// Rotate the journal of node `i` and collect the overflow metadata
    pub async fn snapshot(&self, i: usize) -> crate::metadata::OverflowMetadata {
        let node = self.node(i);
        let snapshot = node.synchronous_overflow().unwrap();
        node.collect_metadata(&snapshot).await.unwrap()
    }
}
