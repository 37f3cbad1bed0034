//! Resource transfer between nodes
//!
//! Moves ship segment files from the source node to the target. The target
//! pulls each artifact from the source's transfer address.

use async_trait::async_trait;
use dashmap::DashMap;
use spanstore_common::{ArtifactId, Error, Result};
use spanstore_storage::{ArtifactPayload, ShardStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Client of the resource transfer service
#[async_trait]
pub trait ResourceTransfer: Send + Sync {
    /// Fetch an artifact from the node serving `source`
    async fn fetch(&self, source: SocketAddr, artifact: ArtifactId) -> Result<ArtifactPayload>;
}

/// Transfer service for nodes living in one process
#[derive(Default)]
pub struct LocalTransfer {
    stores: DashMap<SocketAddr, Arc<dyn ShardStore>>,
    fail_fetches: AtomicBool,
    bytes_sent: AtomicU64,
}

impl LocalTransfer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the artifacts of `store` at `addr`
    pub fn serve(&self, addr: SocketAddr, store: Arc<dyn ShardStore>) {
        self.stores.insert(addr, store);
    }

    /// Stop serving `addr`
    pub fn shutdown(&self, addr: &SocketAddr) {
        self.stores.remove(addr);
    }

    /// Make every subsequent fetch fail
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Total bytes shipped
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ResourceTransfer for LocalTransfer {
    async fn fetch(&self, source: SocketAddr, artifact: ArtifactId) -> Result<ArtifactPayload> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(Error::Transfer(format!("connection to {source} reset")));
        }
        let store = self
            .stores
            .get(&source)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::ChannelClosed(format!("no transfer service at {source}")))?;
        let payload = store.read_artifact(&artifact)?;
        self.bytes_sent
            .fetch_add(payload.metadata.byte_len, Ordering::Relaxed);
        Ok(payload)
    }
}
