//! Storage substrate contract
//!
//! The overflow engine consumes storage through [`ShardStore`]. A store owns
//! one live journal (mutable, absorbing writes), the closed journals kept for
//! historical reads, and the immutable segments built from them. Every shard
//! is described by a [`ShardDefinition`] whose source list always starts
//! with the live journal.

use crate::view::{Tree, View};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spanstore_common::{
    ArtifactId, ArtifactMetadata, CommitTime, KeyRange, OverflowConfig, Result,
    ScatterSplitConfig, ShardName,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub use crate::view::SourceRef;

/// Definition of a shard as registered on a node
#[derive(Clone, Debug, PartialEq)]
pub struct ShardDefinition {
    pub name: ShardName,
    pub range: KeyRange,
    /// Sources newest first; the first is the journal that absorbs writes
    pub sources: Vec<SourceRef>,
    /// Partition id of the shard being moved onto this node, cleared once
    /// the move has cut over
    pub source_partition_id: Option<u32>,
    /// Scatter split settings of the scale-out index
    pub scatter: ScatterSplitConfig,
}

impl ShardDefinition {
    /// A definition whose only source is `journal`
    #[must_use]
    pub fn on_journal(name: ShardName, range: KeyRange, journal: ArtifactId) -> Self {
        Self {
            name,
            range,
            sources: vec![SourceRef::Journal(journal)],
            source_partition_id: None,
            scatter: ScatterSplitConfig::default(),
        }
    }

    /// True while a move onto this node is landing the shard
    #[must_use]
    pub const fn is_move_in_progress(&self) -> bool {
        self.source_partition_id.is_some()
    }
}

/// Cumulative write activity of one shard
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounters {
    /// Tuples written with a value
    pub inserts: u64,
    /// Deleted markers written
    pub removes: u64,
    /// Inserts of keys not previously visible
    pub new_keys: u64,
    /// New keys written past the shard's right-most key
    pub appends: u64,
    /// Bytes written
    pub bytes_written: u64,
}

impl WriteCounters {
    /// Activity between an earlier mark and this one
    #[must_use]
    pub const fn since(&self, mark: &Self) -> Self {
        Self {
            inserts: self.inserts.saturating_sub(mark.inserts),
            removes: self.removes.saturating_sub(mark.removes),
            new_keys: self.new_keys.saturating_sub(mark.new_keys),
            appends: self.appends.saturating_sub(mark.appends),
            bytes_written: self.bytes_written.saturating_sub(mark.bytes_written),
        }
    }

    /// Tuple writes of any kind
    #[must_use]
    pub const fn writes(&self) -> u64 {
        self.inserts + self.removes
    }
}

/// Result of a synchronous overflow (journal rotation)
#[derive(Clone, Debug)]
pub struct OverflowSnapshot {
    /// Commit time of the last write on the old journal
    pub last_commit_time: CommitTime,
    pub old_journal: ArtifactId,
    pub new_journal: ArtifactId,
    /// Every shard defined as of `last_commit_time`
    pub shards: Vec<ShardName>,
    /// Shards whose buffered writes were copied onto the new journal
    pub copied: BTreeSet<ShardName>,
}

/// Contents of an artifact as shipped between nodes
#[derive(Clone, Debug)]
pub struct ArtifactPayload {
    pub metadata: ArtifactMetadata,
    pub entries: Arc<Tree>,
}

/// The storage substrate of one data node
pub trait ShardStore: Send + Sync {
    /// Id of the live journal
    fn live_journal(&self) -> ArtifactId;

    /// Commit time of the most recent write
    fn last_commit_time(&self) -> CommitTime;

    /// Live journal size as a fraction of its nominal maximum extent
    fn journal_extent(&self) -> f64;

    /// Rotate the live journal. Shards with few buffered writes are copied
    /// onto the new journal; every other shard keeps the old journal in its
    /// view until an overflow task releases it.
    fn overflow(&self, config: &OverflowConfig) -> Result<OverflowSnapshot>;

    /// Names of all live shards
    fn shard_names(&self) -> Vec<ShardName>;

    /// Live definition of a shard
    fn shard_definition(&self, name: &ShardName) -> Option<ShardDefinition>;

    /// Read-only view of a shard as of `timestamp`, `None` if the shard was
    /// not defined then
    fn open_historical_view(&self, name: &ShardName, timestamp: CommitTime)
    -> Result<Option<View>>;

    /// Current view of a live shard. Retired names fail with a stale-locator
    /// error.
    fn open_live_view(&self, name: &ShardName) -> Result<View>;

    /// View over only the live journal's tree for a shard
    fn live_journal_view(&self, name: &ShardName) -> Result<View>;

    /// Build an immutable segment from `[from, to)` of `view`. Compacting
    /// builds drop deleted markers. The artifact is held in the retention
    /// set before it becomes visible; a failed build leaves no artifact.
    fn build_artifact(
        &self,
        view: &View,
        compacting: bool,
        commit_time: CommitTime,
        from: &[u8],
        to: Option<&[u8]>,
    ) -> Result<ArtifactMetadata>;

    /// Metadata of a stored artifact
    fn artifact(&self, id: &ArtifactId) -> Option<ArtifactMetadata>;

    /// Read an artifact for shipping to another node
    fn read_artifact(&self, id: &ArtifactId) -> Result<ArtifactPayload>;

    /// Store an artifact received from another node. The artifact is held in
    /// the retention set before it becomes visible.
    fn install_artifact(&self, payload: ArtifactPayload) -> Result<ArtifactMetadata>;

    /// Delete an unreferenced artifact
    fn delete_artifact(&self, id: &ArtifactId) -> Result<()>;

    /// Register a new shard, optionally seeding its live journal tree
    fn register_shard(&self, definition: ShardDefinition, seed: Option<Tree>) -> Result<()>;

    /// Replace the definition of a live shard
    fn replace_definition(&self, definition: ShardDefinition) -> Result<()>;

    /// Drop a live shard
    fn drop_shard(&self, name: &ShardName) -> Result<()>;

    /// Copy the live journal tuples of `from` within `range` (deleted
    /// markers included) into the live journal tree of `to`
    fn copy_live_writes(&self, from: &ShardName, to: &ShardName, range: &KeyRange)
    -> Result<u64>;

    /// Write a tuple (`None` deletes) to a live shard
    fn write(&self, name: &ShardName, key: Bytes, value: Option<Bytes>) -> Result<CommitTime>;

    /// Cumulative write counters per live shard
    fn write_counters(&self) -> HashMap<ShardName, WriteCounters>;

    /// Delete segments and closed journals that no live or current
    /// historical definition references and that are not held. Returns the
    /// released ids.
    fn purge_unused(&self) -> Vec<ArtifactId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_since_mark() {
        let mark = WriteCounters {
            inserts: 10,
            removes: 2,
            new_keys: 5,
            appends: 4,
            bytes_written: 100,
        };
        let now = WriteCounters {
            inserts: 15,
            removes: 3,
            new_keys: 8,
            appends: 7,
            bytes_written: 160,
        };
        let delta = now.since(&mark);
        assert_eq!(delta.writes(), 6);
        assert_eq!(delta.appends, 3);
        assert_eq!(now.since(&now), WriteCounters::default());
    }
}
