//! Spanstore Client - Cluster service clients
//!
//! This crate defines the clients a data node uses to talk to the rest of
//! the cluster (metadata index, load balancer, resource transfer and peer
//! nodes), together with in-process implementations used to run a local
//! cluster.

pub mod balancer;
pub mod metadata;
pub mod peer;
pub mod transfer;

// Re-exports
pub use balancer::{LoadBalancer, StaticLoadBalancer};
pub use metadata::{MemoryMetadataIndex, MetadataIndex};
pub use peer::{NodeDirectory, PeerNode, ReceiveShardRequest, StaticDirectory};
pub use transfer::{LocalTransfer, ResourceTransfer};
