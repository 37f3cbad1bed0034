//! Random write workload
//!
//! Two scale-out indices are driven: `users` receives uniformly random keys
//! and `events` receives ever increasing keys, so it keeps appending past
//! its right-most key.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use spanstore_client::MetadataIndex;
use spanstore_common::{Error, Result, ShardName, SimulationConfig};
use spanstore_overflow::LocalCluster;
use tracing::{debug, warn};

pub const USERS: &str = "users";
pub const EVENTS: &str = "events";

/// Attempts per write before giving up on a shard that keeps moving
const MAX_ATTEMPTS: u32 = 3;

/// Share of writes going to the `users` index
const USERS_SHARE: f64 = 0.75;

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct WorkloadStats {
    pub writes: u64,
    pub deletes: u64,
    pub relocated: u64,
    pub failed: u64,
}

pub struct Workload {
    rng: StdRng,
    config: SimulationConfig,
    value: Bytes,
    next_event: u64,
}

fn user_key(i: u64) -> Bytes {
    Bytes::from(format!("user{i:010}"))
}

fn event_key(i: u64) -> Bytes {
    Bytes::from(format!("event{i:012}"))
}

impl Workload {
    pub fn new(config: SimulationConfig) -> Self {
        let rng = if config.seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(config.seed)
        };
        let value = Bytes::from(vec![b'x'; config.value_size]);
        Self {
            rng,
            config,
            value,
            next_event: 0,
        }
    }

    /// Create both indices. `users` starts pre-split on node 0; `events`
    /// starts as a single shard on the last node.
    pub async fn seed(&self, cluster: &LocalCluster) -> Result<()> {
        let partitions = self.config.initial_partitions as u64;
        let separators: Vec<Bytes> = (1..partitions)
            .map(|i| user_key(self.config.key_space * i / partitions))
            .collect();
        cluster.create_index(USERS, 0, &separators).await?;
        cluster
            .create_index(EVENTS, cluster.nodes().len() - 1, &[])
            .await?;
        Ok(())
    }

    /// Issue `n` writes against the current shard layout
    pub async fn run(&mut self, cluster: &LocalCluster, n: u64) -> WorkloadStats {
        let mut stats = WorkloadStats::default();
        for _ in 0..n {
            let (index, key) = if self.rng.gen_bool(USERS_SHARE) {
                (USERS, user_key(self.rng.gen_range(0..self.config.key_space)))
            } else {
                self.next_event += 1;
                (EVENTS, event_key(self.next_event))
            };
            let value = if index == USERS && self.rng.gen_bool(self.config.delete_ratio) {
                stats.deletes += 1;
                None
            } else {
                stats.writes += 1;
                Some(self.value.clone())
            };
            if let Err(e) = apply(cluster, index, key, value, &mut stats).await {
                warn!("Write to {index} failed: {e}");
                stats.failed += 1;
            }
        }
        stats
    }
}

/// Route one write through the metadata index, re-resolving the key when
/// the shard it mapped to has been retired
async fn apply(
    cluster: &LocalCluster,
    index: &str,
    key: Bytes,
    value: Option<Bytes>,
    stats: &mut WorkloadStats,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        let locator = cluster.metadata_index.locate(index, &key).await?;
        let node = cluster
            .nodes()
            .iter()
            .find(|n| n.id() == locator.node)
            .ok_or_else(|| Error::NodeNotFound(locator.node.to_string()))?;
        let name = ShardName::new(index, locator.partition_id);
        let result = match &value {
            Some(value) => node.write(&name, key.clone(), value.clone()).await,
            None => node.delete(&name, key.clone()).await,
        };
        match result {
            Ok(_) => return Ok(()),
            Err(e) if (e.is_stale_locator() || e.is_not_found()) && attempt < MAX_ATTEMPTS => {
                debug!("Relocating write to {name}: {e}");
                stats.relocated += 1;
                attempt += 1;
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanstore_common::OverflowConfig;

    #[tokio::test]
    async fn test_workload_follows_the_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new(2, OverflowConfig::default(), dir.path(), 1 << 20).unwrap();
        let config = SimulationConfig {
            seed: 7,
            key_space: 1000,
            ..SimulationConfig::default()
        };
        let mut workload = Workload::new(config);
        workload.seed(&cluster).await.unwrap();
        assert_eq!(cluster.metadata_index.locators(USERS).len(), 2);
        assert_eq!(cluster.metadata_index.locators(EVENTS).len(), 1);

        let stats = workload.run(&cluster, 500).await;
        assert_eq!(stats.writes + stats.deletes, 500);
        assert_eq!(stats.failed, 0);
    }
}
