//! Data node facade
//!
//! A [`DataNode`] owns the storage of one node together with the clients it
//! needs to reach the rest of the cluster. Client writes and reads enter
//! here, as does overflow processing, which rotates the live journal and
//! then runs one asynchronous overflow cycle over the snapshot.

use crate::counters::OverflowCounters;
use crate::error::OverflowResult;
use crate::host::{HostCounters, StaticHostCounters};
use crate::lock::LockManager;
use crate::overflow::OverflowReport;
use crate::scheduler::BoundedPool;
use crate::score::ScoreBoard;
use bytes::Bytes;
use spanstore_client::{LoadBalancer, MetadataIndex, NodeDirectory, ResourceTransfer};
use spanstore_common::{
    ArtifactId, CommitTime, Error, KeyRange, NodeId, OverflowConfig, Result, ScatterSplitConfig,
    ShardName,
};
use spanstore_storage::{
    OverflowSnapshot, RetentionSet, ShardDefinition, ShardStore, StaleLocatorCache,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One storage node of the cluster
pub struct DataNode {
    pub(crate) node_id: NodeId,
    pub(crate) name: String,
    pub(crate) transfer_addr: SocketAddr,
    pub(crate) config: OverflowConfig,
    pub(crate) store: Arc<dyn ShardStore>,
    pub(crate) retention: Arc<RetentionSet>,
    pub(crate) stale: Arc<StaleLocatorCache>,
    pub(crate) locks: LockManager,
    pub(crate) metadata_index: Arc<dyn MetadataIndex>,
    pub(crate) transfer: Arc<dyn ResourceTransfer>,
    pub(crate) directory: Arc<dyn NodeDirectory>,
    pub(crate) load_balancer: Option<Arc<dyn LoadBalancer>>,
    pub(crate) host: Arc<dyn HostCounters>,
    pub(crate) scores: ScoreBoard,
    pub(crate) counters: OverflowCounters,
    pub(crate) build_pool: BoundedPool,
    pub(crate) merge_pool: BoundedPool,
    running: AtomicBool,
    pub(crate) overflow_lock: Mutex<()>,
}

/// Builder for [`DataNode`]
pub struct DataNodeBuilder {
    node_id: NodeId,
    name: String,
    transfer_addr: SocketAddr,
    config: OverflowConfig,
    store: Arc<dyn ShardStore>,
    retention: Arc<RetentionSet>,
    stale: Arc<StaleLocatorCache>,
    metadata_index: Option<Arc<dyn MetadataIndex>>,
    transfer: Option<Arc<dyn ResourceTransfer>>,
    directory: Option<Arc<dyn NodeDirectory>>,
    load_balancer: Option<Arc<dyn LoadBalancer>>,
    host: Option<Arc<dyn HostCounters>>,
}

impl DataNodeBuilder {
    /// `retention` and `stale` must be the sets the store itself consults
    #[must_use]
    pub fn new(
        config: OverflowConfig,
        store: Arc<dyn ShardStore>,
        retention: Arc<RetentionSet>,
        stale: Arc<StaleLocatorCache>,
    ) -> Self {
        Self {
            node_id: NodeId::new(),
            name: "spanstore-node".to_string(),
            transfer_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            config,
            store,
            retention,
            stale,
            metadata_index: None,
            transfer: None,
            directory: None,
            load_balancer: None,
            host: None,
        }
    }

    #[must_use]
    pub const fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub const fn transfer_addr(mut self, addr: SocketAddr) -> Self {
        self.transfer_addr = addr;
        self
    }

    #[must_use]
    pub fn metadata_index(mut self, metadata_index: Arc<dyn MetadataIndex>) -> Self {
        self.metadata_index = Some(metadata_index);
        self
    }

    #[must_use]
    pub fn transfer(mut self, transfer: Arc<dyn ResourceTransfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    #[must_use]
    pub fn directory(mut self, directory: Arc<dyn NodeDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn load_balancer(mut self, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        self.load_balancer = Some(load_balancer);
        self
    }

    #[must_use]
    pub fn host(mut self, host: Arc<dyn HostCounters>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> Result<Arc<DataNode>> {
        self.config.validate()?;
        let missing = |what: &str| Error::Configuration(format!("data node requires a {what}"));
        let metadata_index = self.metadata_index.ok_or_else(|| missing("metadata index"))?;
        let transfer = self.transfer.ok_or_else(|| missing("resource transfer"))?;
        let directory = self.directory.ok_or_else(|| missing("node directory"))?;

        Ok(Arc::new(DataNode {
            node_id: self.node_id,
            name: self.name,
            transfer_addr: self.transfer_addr,
            build_pool: BoundedPool::new("build", self.config.build_pool_size),
            merge_pool: BoundedPool::new("merge", self.config.merge_pool_size),
            config: self.config,
            store: self.store,
            retention: self.retention,
            stale: self.stale,
            locks: LockManager::new(),
            metadata_index,
            transfer,
            directory,
            load_balancer: self.load_balancer,
            host: self
                .host
                .unwrap_or_else(|| Arc::new(StaticHostCounters::default())),
            scores: ScoreBoard::new(),
            counters: OverflowCounters::new(),
            running: AtomicBool::new(true),
            overflow_lock: Mutex::new(()),
        }))
    }
}

impl DataNode {
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.transfer_addr
    }

    #[must_use]
    pub const fn config(&self) -> &OverflowConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ShardStore> {
        &self.store
    }

    #[must_use]
    pub const fn counters(&self) -> &OverflowCounters {
        &self.counters
    }

    #[must_use]
    pub const fn retention(&self) -> &Arc<RetentionSet> {
        &self.retention
    }

    #[must_use]
    pub const fn stale_locators(&self) -> &Arc<StaleLocatorCache> {
        &self.stale
    }

    #[must_use]
    pub const fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Refuse new client and overflow work
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Data node {} shutting down", self.name);
            self.build_pool.close();
            self.merge_pool.close();
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Register an empty shard on the live journal
    pub fn create_shard(
        &self,
        name: ShardName,
        range: KeyRange,
        scatter: ScatterSplitConfig,
    ) -> Result<()> {
        let mut definition = ShardDefinition::on_journal(name, range, self.store.live_journal());
        definition.scatter = scatter;
        debug!("Registering {} {}", definition.name, definition.range);
        self.store.register_shard(definition, None)
    }

    /// Write a tuple. Writes to a retired name fail with a stale-locator
    /// error telling the client to re-resolve the key.
    pub async fn write(&self, name: &ShardName, key: Bytes, value: Bytes) -> Result<CommitTime> {
        self.check_running()?;
        let _locks = self.locks.lock(std::slice::from_ref(name)).await;
        self.store.write(name, key, Some(value))
    }

    /// Write a deleted marker
    pub async fn delete(&self, name: &ShardName, key: Bytes) -> Result<CommitTime> {
        self.check_running()?;
        let _locks = self.locks.lock(std::slice::from_ref(name)).await;
        self.store.write(name, key, None)
    }

    /// Read the current value of a key
    pub fn read(&self, name: &ShardName, key: &[u8]) -> Result<Option<Bytes>> {
        self.check_running()?;
        let view = self.store.open_live_view(name)?;
        if !view.range().contains(key) {
            return Err(Error::invalid_argument(format!(
                "key outside the range {} of {name}",
                view.range()
            )));
        }
        Ok(view.lookup(key))
    }

    /// The live journal is full enough to overflow
    #[must_use]
    pub fn should_overflow(&self) -> bool {
        self.store.journal_extent() >= self.config.overflow_threshold
    }

    /// The live journal has grown past the overflow threshold of its
    /// maximum extent; new merges are refused
    #[must_use]
    pub fn is_journal_overextended(&self) -> bool {
        self.store.journal_extent() > self.config.overflow_threshold
    }

    /// Rotate the live journal
    pub fn synchronous_overflow(&self) -> Result<OverflowSnapshot> {
        self.check_running()?;
        self.store.overflow(&self.config)
    }

    /// Rotate the live journal and run one asynchronous overflow cycle over
    /// the snapshot. Cycles never overlap.
    pub async fn overflow(self: &Arc<Self>) -> OverflowResult<OverflowReport> {
        let _cycle = self.overflow_lock.lock().await;
        let snapshot = self.synchronous_overflow()?;
        self.asynchronous_overflow(snapshot).await
    }

    /// Release artifacts no view references any more
    pub fn purge_unused(&self) -> Vec<ArtifactId> {
        let released = self.store.purge_unused();
        self.locks.prune();
        if !released.is_empty() {
            debug!("Released {} artifacts on {}", released.len(), self.name);
        }
        released
    }
}
