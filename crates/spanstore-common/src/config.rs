//! Configuration types for spanstore
//!
//! This module defines the configuration structures shared by the storage
//! nodes and the overflow engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One megabyte
pub const MB: u64 = 1024 * 1024;

/// One gigabyte
pub const GB: u64 = 1024 * MB;

/// Root configuration for a spanstore data node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Overflow processing configuration
    pub overflow: OverflowConfig,
    /// In-process cluster driven by the simulator
    pub simulation: SimulationConfig,
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Data directory for journals and segments
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "spanstore-node".to_string(),
            data_dir: PathBuf::from("/var/lib/spanstore"),
        }
    }
}

/// Workload of the in-process cluster simulator
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of data nodes
    pub nodes: usize,
    /// Number of overflow cycles to run before exiting
    pub cycles: u64,
    /// Pause between cycles in milliseconds
    pub interval_ms: u64,
    /// Writes issued between two cycles
    pub writes_per_cycle: u64,
    /// Fraction of writes that remove a key
    pub delete_ratio: f64,
    /// Distinct keys per index
    pub key_space: u64,
    /// Value size in bytes
    pub value_size: usize,
    /// Live journal capacity of each node
    pub max_journal_bytes: u64,
    /// Partitions each seeded index starts with
    pub initial_partitions: usize,
    /// Seed of the workload generator (0 = random)
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            cycles: 10,
            interval_ms: 500,
            writes_per_cycle: 5000,
            delete_ratio: 0.05,
            key_space: 100_000,
            value_size: 64,
            max_journal_bytes: 4 * MB,
            initial_partitions: 2,
            seed: 0,
        }
    }
}

impl SimulationConfig {
    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.nodes == 0 {
            return Err(crate::Error::Configuration("nodes must be positive".into()));
        }
        if self.key_space == 0 || self.initial_partitions == 0 {
            return Err(crate::Error::Configuration(
                "key_space and initial_partitions must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.delete_ratio) {
            return Err(crate::Error::Configuration(
                "delete_ratio must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// How an asynchronous overflow cycle executes its work
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    /// Plan every shard once, then run the planned tasks against a deadline
    #[default]
    Planned,
    /// Build and merge on bounded pools, then run the follow-up
    /// split actions of merged shards against a deadline
    AfterAction,
}

/// Tuning knobs for asynchronous overflow processing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OverflowConfig {
    /// Execution mode for each cycle
    pub mode: OverflowMode,
    /// Shards with at most this many buffered tuples are copied onto the
    /// new journal at synchronous overflow instead of being built
    pub copy_index_threshold: u64,
    /// Journal extent (as a fraction of its maximum) beyond which new
    /// merges are refused
    pub overflow_threshold: f64,
    /// Minimum percent of split for a tail split
    pub percent_of_split_threshold: f64,
    /// Minimum ratio of appends to new-key inserts for a tail split
    pub tail_split_threshold: f64,
    /// Enable scatter splits on this node
    pub scatter_split_enabled: bool,
    /// Enable joins of under-capacity siblings
    pub joins_enabled: bool,
    /// Do not move shards away when this many or fewer are active
    pub minimum_active_index_partitions: usize,
    /// Maximum moves per cycle
    pub maximum_moves: usize,
    /// Maximum moves per target node per cycle (0 disables moves)
    pub maximum_moves_per_target: usize,
    /// Shards above this percent of split are never moved whole
    pub maximum_move_percent_of_split: f64,
    /// CPU utilization above which the node considers shedding shards
    pub move_percent_cpu_time_threshold: f64,
    /// Maximum optional compacting merges per cycle
    pub maximum_optional_merges_per_overflow: usize,
    /// A view with more journals than this requires a merge
    pub maximum_journals_per_view: usize,
    /// A view with more segments than this requires a merge
    pub maximum_segments_per_view: usize,
    /// Wall-clock budget for one asynchronous overflow cycle
    pub overflow_timeout_secs: u64,
    /// Concurrent tasks in planned mode (0 = unbounded, 1 = single thread)
    pub overflow_tasks_concurrent: usize,
    /// Abandon remaining tasks when the live journal must overflow again
    pub overflow_cancelled_when_journal_full: bool,
    /// Capacity of the build pool
    pub build_pool_size: usize,
    /// Capacity of the merge pool
    pub merge_pool_size: usize,
    /// Nominal size of a full shard in bytes
    pub nominal_shard_size: u64,
    /// Capacity of the stale-locator cache
    pub stale_locator_capacity: usize,
    /// Fan-out used to locate tail split points
    pub branching_factor: usize,
    /// Timeout for calls to peer nodes and cluster services
    pub rpc_timeout_secs: u64,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            mode: OverflowMode::default(),
            copy_index_threshold: 1000,
            overflow_threshold: 0.9,
            percent_of_split_threshold: 0.9,
            tail_split_threshold: 0.4,
            scatter_split_enabled: true,
            joins_enabled: true,
            minimum_active_index_partitions: 1,
            maximum_moves: 3,
            maximum_moves_per_target: 2,
            maximum_move_percent_of_split: 1.0,
            move_percent_cpu_time_threshold: 0.7,
            maximum_optional_merges_per_overflow: 2,
            maximum_journals_per_view: 3,
            maximum_segments_per_view: 6,
            overflow_timeout_secs: 600,
            overflow_tasks_concurrent: 0,
            overflow_cancelled_when_journal_full: true,
            build_pool_size: 3,
            merge_pool_size: 1,
            nominal_shard_size: 200 * MB,
            stale_locator_capacity: 1000,
            branching_factor: 32,
            rpc_timeout_secs: 30,
        }
    }
}

impl OverflowConfig {
    /// Wall-clock budget for one asynchronous overflow cycle
    #[must_use]
    pub const fn overflow_timeout(&self) -> Duration {
        Duration::from_secs(self.overflow_timeout_secs)
    }

    /// Timeout for calls to peer nodes and cluster services
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// True when a view with this many journals and segments must be merged
    #[must_use]
    pub const fn is_mandatory_merge(&self, journals: usize, segments: usize) -> bool {
        journals > self.maximum_journals_per_view || segments > self.maximum_segments_per_view
    }

    /// True when the buffered writes of a shard are small enough to be
    /// copied onto the new journal during synchronous overflow
    #[must_use]
    pub const fn should_copy(&self, buffered_entries: u64, mandatory_merge: bool) -> bool {
        buffered_entries == 0 || (buffered_entries <= self.copy_index_threshold && !mandatory_merge)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.nominal_shard_size == 0 {
            return Err(crate::Error::Configuration(
                "nominal_shard_size must be positive".into(),
            ));
        }
        if self.build_pool_size == 0 || self.merge_pool_size == 0 {
            return Err(crate::Error::Configuration(
                "build_pool_size and merge_pool_size must be positive".into(),
            ));
        }
        if self.stale_locator_capacity == 0 {
            return Err(crate::Error::Configuration(
                "stale_locator_capacity must be positive".into(),
            ));
        }
        if self.branching_factor < 2 {
            return Err(crate::Error::Configuration(
                "branching_factor must be at least 2".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.maximum_move_percent_of_split) {
            return Err(crate::Error::Configuration(
                "maximum_move_percent_of_split must be in [0, 2]".into(),
            ));
        }
        Ok(())
    }
}

/// Scatter split settings carried by each scale-out index
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterSplitConfig {
    /// Allow scatter splits of this index
    pub enabled: bool,
    /// Minimum percent of split before the sole shard is scattered
    pub percent_of_split_threshold: f64,
    /// Number of peer nodes to scatter onto
    pub data_service_count: usize,
    /// Number of shards to produce (0 = twice the number of targets)
    pub index_partition_count: usize,
}

impl Default for ScatterSplitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            percent_of_split_threshold: 0.25,
            data_service_count: 2,
            index_partition_count: 0,
        }
    }
}
