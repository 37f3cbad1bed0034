//! Fused multi-source views over a shard
//!
//! A view is the ordered list of sources (newest first) that together define
//! the readable content of a shard: the live journal's mutable tree, zero or
//! more older journal trees, and zero or more immutable segments. Newer
//! sources shadow older ones, and a deleted marker hides the key.

use bytes::Bytes;
use spanstore_common::{ArtifactId, CommitTime, KeyRange, ShardName};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Fixed per-tuple overhead used when estimating on-disk size
pub const TUPLE_OVERHEAD_BYTES: u64 = 16;

/// A versioned tuple. `value == None` is a deleted marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub value: Option<Bytes>,
    pub version: CommitTime,
}

impl Entry {
    /// Create a live tuple
    #[must_use]
    pub const fn value(value: Bytes, version: CommitTime) -> Self {
        Self {
            value: Some(value),
            version,
        }
    }

    /// Create a deleted marker
    #[must_use]
    pub const fn deleted(version: CommitTime) -> Self {
        Self {
            value: None,
            version,
        }
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.value.is_none()
    }

    /// Estimated encoded size of this tuple under `key`
    #[must_use]
    pub fn encoded_len(&self, key: &[u8]) -> u64 {
        key.len() as u64 + self.value.as_ref().map_or(0, |v| v.len() as u64) + TUPLE_OVERHEAD_BYTES
    }
}

/// Ordered tuples of one source
pub type Tree = BTreeMap<Bytes, Entry>;

/// Estimated encoded size of a tree
#[must_use]
pub fn tree_bytes(tree: &Tree) -> u64 {
    tree.iter().map(|(k, e)| e.encoded_len(k)).sum()
}

/// Identity of a view source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceRef {
    Journal(ArtifactId),
    Segment(ArtifactId),
}

impl SourceRef {
    #[must_use]
    pub const fn id(&self) -> ArtifactId {
        match self {
            Self::Journal(id) | Self::Segment(id) => *id,
        }
    }

    #[must_use]
    pub const fn is_journal(&self) -> bool {
        matches!(self, Self::Journal(_))
    }
}

/// One resolved source of a view
#[derive(Clone, Debug)]
pub struct Source {
    pub source: SourceRef,
    pub tree: Arc<Tree>,
    /// Size of the source in bytes (file length for segments, estimate for journals)
    pub byte_len: u64,
}

/// Read-only fused view of a shard
#[derive(Clone, Debug)]
pub struct View {
    name: ShardName,
    range: KeyRange,
    commit_time: CommitTime,
    sources: Vec<Source>,
}

fn bounds<'a>(from: &'a [u8], to: Option<&'a [u8]>) -> (Bound<&'a [u8]>, Bound<&'a [u8]>) {
    (
        Bound::Included(from),
        to.map_or(Bound::Unbounded, Bound::Excluded),
    )
}

fn is_empty_window(range: &KeyRange) -> bool {
    range.right.as_ref().is_some_and(|r| range.left >= *r)
}

impl View {
    /// Create a view from sources ordered newest first
    #[must_use]
    pub const fn new(
        name: ShardName,
        range: KeyRange,
        commit_time: CommitTime,
        sources: Vec<Source>,
    ) -> Self {
        Self {
            name,
            range,
            commit_time,
            sources,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &ShardName {
        &self.name
    }

    #[must_use]
    pub const fn range(&self) -> &KeyRange {
        &self.range
    }

    /// Commit time the view is pinned to
    #[must_use]
    pub const fn commit_time(&self) -> CommitTime {
        self.commit_time
    }

    #[must_use]
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Source identities, newest first
    #[must_use]
    pub fn source_refs(&self) -> Vec<SourceRef> {
        self.sources.iter().map(|s| s.source).collect()
    }

    #[must_use]
    pub fn journal_count(&self) -> usize {
        self.sources.iter().filter(|s| s.source.is_journal()).count()
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.sources.len() - self.journal_count()
    }

    /// Sum of journal source sizes
    #[must_use]
    pub fn journal_bytes(&self) -> u64 {
        self.sources
            .iter()
            .filter(|s| s.source.is_journal())
            .map(|s| s.byte_len)
            .sum()
    }

    /// Sum of segment source sizes
    #[must_use]
    pub fn segment_bytes(&self) -> u64 {
        self.sources
            .iter()
            .filter(|s| !s.source.is_journal())
            .map(|s| s.byte_len)
            .sum()
    }

    /// Tuples (including deleted markers) held by the journal sources
    #[must_use]
    pub fn journal_entry_count(&self) -> u64 {
        self.sources
            .iter()
            .filter(|s| s.source.is_journal())
            .map(|s| s.tree.len() as u64)
            .sum()
    }

    /// Exactly one journal and one segment
    #[must_use]
    pub fn is_compact(&self) -> bool {
        self.journal_count() == 1 && self.segment_count() == 1
    }

    /// A view restricted to the journal sources (the buffered writes)
    #[must_use]
    pub fn journals_only(&self) -> Self {
        Self {
            name: self.name.clone(),
            range: self.range.clone(),
            commit_time: self.commit_time,
            sources: self
                .sources
                .iter()
                .filter(|s| s.source.is_journal())
                .cloned()
                .collect(),
        }
    }

    /// Point lookup through the fused view
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<Bytes> {
        if !self.range.contains(key) {
            return None;
        }
        self.sources
            .iter()
            .find_map(|s| s.tree.get(key))
            .and_then(|e| e.value.clone())
    }

    /// Upper bound on the number of tuples in `[from, to)`, counting every
    /// source and deleted markers
    #[must_use]
    pub fn range_count(&self, from: &[u8], to: Option<&[u8]>) -> u64 {
        let clamped = self.range.clamp(from, to);
        if is_empty_window(&clamped) {
            return 0;
        }
        let (lo, hi) = bounds(&clamped.left, clamped.right.as_deref());
        self.sources
            .iter()
            .map(|s| s.tree.range::<[u8], _>((lo, hi)).count() as u64)
            .sum()
    }

    /// Fused tuples in `[from, to)`, newest version of each key, deleted
    /// markers included
    #[must_use]
    pub fn range_entries(&self, from: &[u8], to: Option<&[u8]>) -> Tree {
        let clamped = self.range.clamp(from, to);
        let mut fused = Tree::new();
        if is_empty_window(&clamped) {
            return fused;
        }
        let (lo, hi) = bounds(&clamped.left, clamped.right.as_deref());
        for source in self.sources.iter().rev() {
            for (k, e) in source.tree.range::<[u8], _>((lo, hi)) {
                fused.insert(k.clone(), e.clone());
            }
        }
        fused
    }

    /// Keys with a visible value, in order
    #[must_use]
    pub fn live_keys(&self) -> Vec<Bytes> {
        self.range_entries(&self.range.left, self.range.right.as_deref())
            .into_iter()
            .filter(|(_, e)| !e.is_deleted())
            .map(|(k, _)| k)
            .collect()
    }

    /// Copy the fused tuples in `[from, to)` into `dest`, overwriting older
    /// versions there. Deleted markers are copied only when
    /// `include_deleted` is set. Returns the number of tuples copied.
    pub fn range_copy(
        &self,
        dest: &mut Tree,
        from: &[u8],
        to: Option<&[u8]>,
        include_deleted: bool,
    ) -> u64 {
        let mut copied = 0;
        for (k, e) in self.range_entries(from, to) {
            if e.is_deleted() && !include_deleted {
                continue;
            }
            dest.insert(k, e);
            copied += 1;
        }
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(entries: &[(&'static str, Option<&'static str>)]) -> Arc<Tree> {
        Arc::new(
            entries
                .iter()
                .map(|(k, v)| {
                    let entry = match v {
                        Some(v) => Entry::value(Bytes::from_static(v.as_bytes()), 1),
                        None => Entry::deleted(1),
                    };
                    (Bytes::from_static(k.as_bytes()), entry)
                })
                .collect(),
        )
    }

    fn view() -> View {
        let newer = tree(&[("b", None), ("c", Some("c2"))]);
        let older = tree(&[("a", Some("a1")), ("b", Some("b1")), ("c", Some("c1"))]);
        View::new(
            ShardName::new("idx", 0),
            KeyRange::full(),
            5,
            vec![
                Source {
                    source: SourceRef::Journal(ArtifactId::new()),
                    byte_len: tree_bytes(&newer),
                    tree: newer,
                },
                Source {
                    source: SourceRef::Segment(ArtifactId::new()),
                    byte_len: 100,
                    tree: older,
                },
            ],
        )
    }

    #[test]
    fn test_lookup_newest_wins() {
        let view = view();
        assert_eq!(view.lookup(b"a"), Some(Bytes::from_static(b"a1")));
        assert_eq!(view.lookup(b"b"), None);
        assert_eq!(view.lookup(b"c"), Some(Bytes::from_static(b"c2")));
    }

    #[test]
    fn test_range_count_is_upper_bound() {
        let view = view();
        assert_eq!(view.range_count(b"", None), 5);
        assert_eq!(view.live_keys().len(), 2);
    }

    #[test]
    fn test_range_copy_deleted_markers() {
        let view = view();
        let mut compact = Tree::new();
        assert_eq!(view.range_copy(&mut compact, b"", None, false), 2);
        assert!(!compact.contains_key(b"b".as_slice()));

        let mut full = Tree::new();
        assert_eq!(view.range_copy(&mut full, b"", None, true), 3);
        assert!(full[b"b".as_slice()].is_deleted());
    }

    #[test]
    fn test_source_shape() {
        let view = view();
        assert!(view.is_compact());
        assert_eq!(view.journal_count(), 1);
        assert_eq!(view.segment_count(), 1);
        assert_eq!(view.segment_bytes(), 100);
        assert_eq!(view.journals_only().sources().len(), 1);
    }

    #[test]
    fn test_range_clipped_to_shard() {
        let mut view = view();
        view.range = KeyRange::new(Bytes::from_static(b"b"), None);
        assert_eq!(view.lookup(b"a"), None);
        assert_eq!(view.live_keys(), vec![Bytes::from_static(b"c")]);
    }
}
