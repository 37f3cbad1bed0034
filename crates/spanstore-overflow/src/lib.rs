//! Spanstore Overflow - Asynchronous overflow engine
//!
//! This crate reorganizes the shards of a data node each time its live
//! journal fills up:
//! - Scoring shard write activity between cycles
//! - Planning one action per shard (build, merge, split, join or move)
//! - Running builds and merges on bounded pools
//! - Two-phase task execution with atomic updates under per-shard locks
//! - Handing shards to other nodes and receiving them
//!
//! # Cycle
//!
//! ```text
//! synchronous overflow ──► collect metadata ──► plan ──► run tasks
//!   (rotate journal,         (views, stats,              (historical read,
//!    copy small shards)       scores)                     atomic update)
//! ```

pub mod cluster;
pub mod counters;
pub mod error;
pub mod host;
pub mod lock;
pub mod metadata;
pub mod node;
pub mod overflow;
pub mod planner;
pub mod scheduler;
pub mod score;
pub mod tasks;

// Re-exports
pub use cluster::LocalCluster;
pub use counters::{CountersSnapshot, OverflowCounters};
pub use error::{OverflowError, OverflowResult};
pub use host::{HostCounters, StaticHostCounters};
pub use lock::{LockManager, ShardLocks};
pub use metadata::{OverflowMetadata, ShardStats, ShardViewMetadata, try_claim_all};
pub use node::{DataNode, DataNodeBuilder};
pub use overflow::OverflowReport;
pub use planner::{ActionPlanner, PlannedTask};
pub use scheduler::{BoundedPool, TaskOutcome, run_tasks, schedule_and_await_tasks};
pub use score::{Score, ScoreBoard};
pub use tasks::{
    ActionResult, BuildResult, JoinResult, MoveResult, SplitKind, SplitResult, TaskProgress,
    TaskReport, TaskState,
};
pub use tasks::moves::reconcile_move;
