//! Load balancer client
//!
//! The load balancer aggregates host and service counters across the
//! cluster. The overflow engine asks it whether this node is overloaded and
//! which nodes could absorb moved shards.

use async_trait::async_trait;
use parking_lot::RwLock;
use spanstore_common::{Error, NodeId, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Client of the cluster load balancer
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// True if `node` is among the most heavily utilized nodes
    async fn is_highly_utilized(&self, node: NodeId) -> Result<bool>;

    /// Under-utilized nodes, least utilized first, excluding `exclude`.
    /// Returns an empty list when fewer than `min` qualify; `max == 0`
    /// means no upper bound.
    async fn under_utilized_nodes(
        &self,
        min: usize,
        max: usize,
        exclude: Option<NodeId>,
    ) -> Result<Vec<NodeId>>;
}

/// Load balancer driven by utilization values reported directly to it
pub struct StaticLoadBalancer {
    utilization: RwLock<HashMap<NodeId, f64>>,
    high_watermark: f64,
    low_watermark: f64,
    unavailable: AtomicBool,
}

impl Default for StaticLoadBalancer {
    fn default() -> Self {
        Self::new(0.8, 0.4)
    }
}

impl StaticLoadBalancer {
    /// Nodes at or above `high_watermark` are highly utilized; nodes at or
    /// below `low_watermark` are under-utilized
    #[must_use]
    pub fn new(high_watermark: f64, low_watermark: f64) -> Self {
        Self {
            utilization: RwLock::new(HashMap::new()),
            high_watermark,
            low_watermark,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Record a node's utilization in [0, 1]
    pub fn report(&self, node: NodeId, utilization: f64) {
        self.utilization.write().insert(node, utilization);
    }

    /// Forget a node
    pub fn remove(&self, node: &NodeId) {
        self.utilization.write().remove(node);
    }

    /// Make every query fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Lookup("load balancer unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LoadBalancer for StaticLoadBalancer {
    async fn is_highly_utilized(&self, node: NodeId) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .utilization
            .read()
            .get(&node)
            .is_some_and(|u| *u >= self.high_watermark))
    }

    async fn under_utilized_nodes(
        &self,
        min: usize,
        max: usize,
        exclude: Option<NodeId>,
    ) -> Result<Vec<NodeId>> {
        self.check_available()?;
        let mut candidates: Vec<(NodeId, f64)> = self
            .utilization
            .read()
            .iter()
            .filter(|(node, u)| Some(**node) != exclude && **u <= self.low_watermark)
            .map(|(node, u)| (*node, *u))
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        if candidates.len() < min {
            return Ok(Vec::new());
        }
        if max > 0 {
            candidates.truncate(max);
        }
        Ok(candidates.into_iter().map(|(node, _)| node).collect())
    }
}
