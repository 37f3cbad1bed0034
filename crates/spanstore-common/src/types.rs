//! Core type definitions for spanstore
//!
//! This module defines the identifiers, key ranges and locators shared by
//! every layer, along with the small enums describing overflow actions.

use bytes::Bytes;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Logical commit time assigned by a node's journal
pub type CommitTime = u64;

/// Unique identifier for a data node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new random node ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a storage artifact (segment or journal file)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    /// Generate a new random artifact ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactId({})", self.0)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of one shard (index partition) of a scale-out index.
///
/// Formatted as `<index>#<partition id>`. A shard name is never reused:
/// split, join and move all mint a new partition id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardName {
    index: String,
    partition_id: u32,
}

impl ShardName {
    /// Create a shard name from its scale-out index and partition id
    pub fn new(index: impl Into<String>, partition_id: u32) -> Self {
        Self {
            index: index.into(),
            partition_id,
        }
    }

    /// Name of the scale-out index this shard belongs to
    #[must_use]
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Partition id assigned by the metadata service
    #[must_use]
    pub const fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Parse a `<index>#<partition id>` string
    pub fn parse(s: &str) -> Option<Self> {
        let (index, pid) = s.rsplit_once('#')?;
        if index.is_empty() {
            return None;
        }
        Some(Self::new(index, pid.parse().ok()?))
    }
}

impl fmt::Debug for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.partition_id)
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.partition_id)
    }
}

/// Half-open key range `[left, right)` owned by a shard.
///
/// An empty left separator is the minimum key. A `None` right separator is
/// unbounded.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub left: Bytes,
    pub right: Option<Bytes>,
}

impl KeyRange {
    /// Create a key range
    #[must_use]
    pub const fn new(left: Bytes, right: Option<Bytes>) -> Self {
        Self { left, right }
    }

    /// The range covering the whole key space
    #[must_use]
    pub const fn full() -> Self {
        Self {
            left: Bytes::new(),
            right: None,
        }
    }

    /// Check whether a key falls inside this range
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.left.as_ref() && self.right.as_ref().is_none_or(|r| key < r.as_ref())
    }

    /// True when `next` starts exactly where this range ends
    #[must_use]
    pub fn is_left_sibling_of(&self, next: &Self) -> bool {
        self.right.as_ref() == Some(&next.left)
    }

    /// Intersect with a `[from, to)` window
    #[must_use]
    pub fn clamp(&self, from: &[u8], to: Option<&[u8]>) -> Self {
        let left = if from > self.left.as_ref() {
            Bytes::copy_from_slice(from)
        } else {
            self.left.clone()
        };
        let right = match (self.right.as_ref(), to) {
            (Some(r), Some(t)) if t < r.as_ref() => Some(Bytes::copy_from_slice(t)),
            (Some(r), _) => Some(r.clone()),
            (None, Some(t)) => Some(Bytes::copy_from_slice(t)),
            (None, None) => None,
        };
        Self { left, right }
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, ", String::from_utf8_lossy(&self.left))?;
        match &self.right {
            Some(r) => write!(f, "{})", String::from_utf8_lossy(r)),
            None => write!(f, "+inf)"),
        }
    }
}

/// Entry in the cluster metadata index: which node owns which key range
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLocator {
    pub partition_id: u32,
    pub node: NodeId,
    pub range: KeyRange,
}

impl PartitionLocator {
    /// Create a locator
    #[must_use]
    pub const fn new(partition_id: u32, node: NodeId, range: KeyRange) -> Self {
        Self {
            partition_id,
            node,
            range,
        }
    }
}

/// Why a shard name was retired
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum StaleLocatorReason {
    #[display("Split")]
    Split,
    #[display("Join")]
    Join,
    #[display("Move")]
    Move,
}

/// Terminal action chosen for a shard during one asynchronous overflow cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum OverflowAction {
    /// Buffered writes were copied onto the new journal at synchronous overflow
    #[display("Copy")]
    Copy,
    /// Incremental build of the old journal's buffered writes
    #[display("Build")]
    Build,
    /// Compacting merge of the whole view
    #[display("Merge")]
    Merge,
    #[display("Split")]
    Split,
    #[display("TailSplit")]
    TailSplit,
    #[display("ScatterSplit")]
    ScatterSplit,
    #[display("Join")]
    Join,
    #[display("Move")]
    Move,
}

/// Kind of storage artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ArtifactKind {
    #[display("journal")]
    Journal,
    #[display("segment")]
    Segment,
}

/// Descriptor of an immutable storage artifact
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    /// Commit time of the data captured by the artifact
    pub commit_time: CommitTime,
    /// Size of the artifact in bytes
    pub byte_len: u64,
    /// Number of tuples (including deleted markers) in the artifact
    pub entry_count: u64,
}

/// Host-level resource counters used to decide whether a node should shed load
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceScores {
    /// Fraction of CPU time busy in [0, 1]
    pub percent_cpu_time: f64,
    /// Major page faults per second
    pub major_page_faults_per_sec: f64,
    /// Free bytes on the data directory's file system
    pub data_dir_bytes_free: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_name_format_and_parse() {
        let name = ShardName::new("idx", 7);
        assert_eq!(name.to_string(), "idx#7");
        assert_eq!(ShardName::parse("idx#7"), Some(name));
        assert_eq!(ShardName::parse("a#b#3"), Some(ShardName::new("a#b", 3)));
        assert!(ShardName::parse("#3").is_none());
        assert!(ShardName::parse("idx").is_none());
    }

    #[test]
    fn test_shard_name_ordering() {
        let mut names = vec![
            ShardName::new("b", 1),
            ShardName::new("a", 10),
            ShardName::new("a", 2),
        ];
        names.sort();
        assert_eq!(names[0], ShardName::new("a", 2));
        assert_eq!(names[2], ShardName::new("b", 1));
    }

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::new(Bytes::from_static(b"b"), Some(Bytes::from_static(b"d")));
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"d"));
        assert!(KeyRange::full().contains(b""));
        assert!(KeyRange::full().contains(b"zzz"));
    }

    #[test]
    fn test_key_range_adjacency() {
        let left = KeyRange::new(Bytes::new(), Some(Bytes::from_static(b"m")));
        let right = KeyRange::new(Bytes::from_static(b"m"), None);
        let gap = KeyRange::new(Bytes::from_static(b"n"), None);
        assert!(left.is_left_sibling_of(&right));
        assert!(!left.is_left_sibling_of(&gap));
        assert!(!right.is_left_sibling_of(&left));
    }

    #[test]
    fn test_key_range_clamp() {
        let range = KeyRange::new(Bytes::from_static(b"b"), Some(Bytes::from_static(b"x")));
        let clamped = range.clamp(b"d", Some(b"k"));
        assert_eq!(clamped.left, Bytes::from_static(b"d"));
        assert_eq!(clamped.right, Some(Bytes::from_static(b"k")));
        let wider = range.clamp(b"a", None);
        assert_eq!(wider, range);
    }
}
