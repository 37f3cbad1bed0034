//! Spanstore Storage - Storage substrate for shard views
//!
//! This crate defines the contract the overflow engine uses to read and
//! reorganize shards, and provides an in-memory engine implementing it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ShardStore                           │
//! │  ┌──────────────┐   ┌───────────────┐   ┌───────────────┐   │
//! │  │ live journal │   │ closed        │   │ segments      │   │
//! │  │ (mutable)    │   │ journals      │   │ (immutable)   │   │
//! │  └──────┬───────┘   └───────┬───────┘   └───────┬───────┘   │
//! │         └─────────── View (newest first) ───────┘           │
//! │                                                             │
//! │  RetentionSet ── holds new artifacts until they are wired   │
//! │  StaleLocatorCache ── answers for retired shard names       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod retention;
pub mod stale;
pub mod store;
pub mod view;

pub use memory::MemoryStore;
pub use retention::{RetentionHold, RetentionSet};
pub use stale::{StaleLocatorCache, StaleLocatorStats};
pub use store::{
    ArtifactPayload, OverflowSnapshot, ShardDefinition, ShardStore, SourceRef, WriteCounters,
};
pub use view::{Entry, Source, Tree, View, tree_bytes};
