//! Metadata index client
//!
//! The metadata index maps each key range of a scale-out index to the
//! partition and node that own it. Split, join and move change it through
//! compare-and-swap style updates that name the locators being replaced.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use spanstore_common::{Error, KeyRange, NodeId, PartitionLocator, Result};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Client for the cluster metadata index
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Resolve a batch of keys of one scale-out index, one locator per key
    async fn lookup_siblings(&self, index: &str, keys: &[Bytes]) -> Result<Vec<PartitionLocator>>;

    /// Locator of the shard whose range contains `key`
    async fn locate(&self, index: &str, key: &[u8]) -> Result<PartitionLocator>;

    /// Number of shards of a scale-out index
    async fn partition_count(&self, index: &str) -> Result<usize>;

    /// Allocate the next partition id of a scale-out index
    async fn next_partition_id(&self, index: &str) -> Result<u32>;

    /// Replace one locator by the locators of its splits
    async fn split_shard(
        &self,
        index: &str,
        old: &PartitionLocator,
        new: &[PartitionLocator],
    ) -> Result<()>;

    /// Replace adjacent locators by the locator of their join
    async fn join_shards(
        &self,
        index: &str,
        old: &[PartitionLocator],
        new: &PartitionLocator,
    ) -> Result<()>;

    /// Replace a locator by one on another node
    async fn move_shard(
        &self,
        index: &str,
        old: &PartitionLocator,
        new: &PartitionLocator,
    ) -> Result<()>;
}

#[derive(Default)]
struct IndexEntry {
    next_partition_id: u32,
    /// Locators keyed by left separator
    partitions: BTreeMap<Bytes, PartitionLocator>,
}

impl IndexEntry {
    fn locate(&self, key: &[u8]) -> Option<&PartitionLocator> {
        self.partitions
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, l)| l)
            .filter(|l| l.range.contains(key))
    }

    fn expect(&self, index: &str, old: &PartitionLocator) -> Result<()> {
        match self.partitions.get(&old.range.left) {
            Some(current) if current == old => Ok(()),
            Some(current) => Err(Error::MetadataIndex(format!(
                "{index}: expected partition {} on {}, found partition {} on {}",
                old.partition_id, old.node, current.partition_id, current.node
            ))),
            None => Err(Error::MetadataIndex(format!(
                "{index}: no partition at {}",
                old.range
            ))),
        }
    }
}

fn check_tiling(range: &KeyRange, parts: &[&KeyRange]) -> Result<()> {
    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return Err(Error::invalid_argument("no partitions given"));
    };
    if first.left != range.left || last.right != range.right {
        return Err(Error::invalid_argument(format!(
            "partitions do not cover {range}"
        )));
    }
    if parts.windows(2).any(|w| !w[0].is_left_sibling_of(w[1])) {
        return Err(Error::invalid_argument("partitions are not adjacent"));
    }
    Ok(())
}

/// In-process metadata index shared by every node of a local cluster
#[derive(Default)]
pub struct MemoryMetadataIndex {
    indices: RwLock<HashMap<String, IndexEntry>>,
    fail_lookups: AtomicBool,
    moves: AtomicU64,
}

impl MemoryMetadataIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scale-out index with a single partition owned by `node`.
    /// Returns its locator.
    pub fn create_index(&self, index: &str, node: NodeId) -> Result<PartitionLocator> {
        self.create_index_with_splits(index, node, &[])
            .map(|mut locators| locators.remove(0))
    }

    /// Create a scale-out index pre-split at `separators`, every partition
    /// owned by `node`
    pub fn create_index_with_splits(
        &self,
        index: &str,
        node: NodeId,
        separators: &[Bytes],
    ) -> Result<Vec<PartitionLocator>> {
        let mut indices = self.indices.write();
        if indices.contains_key(index) {
            return Err(Error::invalid_argument(format!("index exists: {index}")));
        }
        let mut entry = IndexEntry::default();
        let mut left = Bytes::new();
        let mut locators = Vec::with_capacity(separators.len() + 1);
        for right in separators.iter().cloned().map(Some).chain(std::iter::once(None)) {
            let locator = PartitionLocator::new(
                entry.next_partition_id,
                node,
                KeyRange::new(left.clone(), right.clone()),
            );
            entry.next_partition_id += 1;
            entry.partitions.insert(left.clone(), locator.clone());
            locators.push(locator);
            left = right.unwrap_or_default();
        }
        indices.insert(index.to_string(), entry);
        Ok(locators)
    }

    /// All locators of an index in key order
    #[must_use]
    pub fn locators(&self, index: &str) -> Vec<PartitionLocator> {
        self.indices
            .read()
            .get(index)
            .map(|e| e.partitions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make batched sibling lookups fail
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Number of applied move updates
    #[must_use]
    pub fn move_count(&self) -> u64 {
        self.moves.load(Ordering::Relaxed)
    }

    fn with_index<T>(
        &self,
        index: &str,
        f: impl FnOnce(&mut IndexEntry) -> Result<T>,
    ) -> Result<T> {
        let mut indices = self.indices.write();
        let entry = indices
            .get_mut(index)
            .ok_or_else(|| Error::MetadataIndex(format!("unknown index: {index}")))?;
        f(entry)
    }
}

#[async_trait]
impl MetadataIndex for MemoryMetadataIndex {
    async fn lookup_siblings(&self, index: &str, keys: &[Bytes]) -> Result<Vec<PartitionLocator>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(Error::Lookup(format!("metadata service unavailable for {index}")));
        }
        let indices = self.indices.read();
        let entry = indices
            .get(index)
            .ok_or_else(|| Error::Lookup(format!("unknown index: {index}")))?;
        keys.iter()
            .map(|key| {
                entry.locate(key).cloned().ok_or_else(|| {
                    Error::Lookup(format!(
                        "{index}: no partition for key {}",
                        String::from_utf8_lossy(key)
                    ))
                })
            })
            .collect()
    }

    async fn locate(&self, index: &str, key: &[u8]) -> Result<PartitionLocator> {
        let indices = self.indices.read();
        indices
            .get(index)
            .and_then(|e| e.locate(key))
            .cloned()
            .ok_or_else(|| Error::Lookup(format!("{index}: no partition for key")))
    }

    async fn partition_count(&self, index: &str) -> Result<usize> {
        self.indices
            .read()
            .get(index)
            .map(|e| e.partitions.len())
            .ok_or_else(|| Error::Lookup(format!("unknown index: {index}")))
    }

    async fn next_partition_id(&self, index: &str) -> Result<u32> {
        self.with_index(index, |entry| {
            let pid = entry.next_partition_id;
            entry.next_partition_id += 1;
            Ok(pid)
        })
    }

    async fn split_shard(
        &self,
        index: &str,
        old: &PartitionLocator,
        new: &[PartitionLocator],
    ) -> Result<()> {
        self.with_index(index, |entry| {
            entry.expect(index, old)?;
            let ranges: Vec<&KeyRange> = new.iter().map(|l| &l.range).collect();
            check_tiling(&old.range, &ranges)?;
            entry.partitions.remove(&old.range.left);
            for locator in new {
                entry
                    .partitions
                    .insert(locator.range.left.clone(), locator.clone());
            }
            debug!("{index}: split partition {} into {}", old.partition_id, new.len());
            Ok(())
        })
    }

    async fn join_shards(
        &self,
        index: &str,
        old: &[PartitionLocator],
        new: &PartitionLocator,
    ) -> Result<()> {
        self.with_index(index, |entry| {
            for locator in old {
                entry.expect(index, locator)?;
            }
            let ranges: Vec<&KeyRange> = old.iter().map(|l| &l.range).collect();
            check_tiling(&new.range, &ranges)?;
            for locator in old {
                entry.partitions.remove(&locator.range.left);
            }
            entry
                .partitions
                .insert(new.range.left.clone(), new.clone());
            debug!("{index}: joined {} partitions into {}", old.len(), new.partition_id);
            Ok(())
        })
    }

    async fn move_shard(
        &self,
        index: &str,
        old: &PartitionLocator,
        new: &PartitionLocator,
    ) -> Result<()> {
        self.with_index(index, |entry| {
            entry.expect(index, old)?;
            if old.range != new.range {
                return Err(Error::invalid_argument("a move cannot change the key range"));
            }
            entry
                .partitions
                .insert(new.range.left.clone(), new.clone());
            self.moves.fetch_add(1, Ordering::Relaxed);
            debug!(
                "{index}: moved partition {} on {} to partition {} on {}",
                old.partition_id, old.node, new.partition_id, new.node
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_create_and_locate() {
        let mdi = MemoryMetadataIndex::new();
        let node = NodeId::new();
        let locators = mdi
            .create_index_with_splits("idx", node, &[key("m")])
            .unwrap();
        assert_eq!(locators.len(), 2);

        assert_eq!(mdi.locate("idx", b"a").await.unwrap().partition_id, 0);
        assert_eq!(mdi.locate("idx", b"m").await.unwrap().partition_id, 1);
        assert_eq!(mdi.next_partition_id("idx").await.unwrap(), 2);
        assert_eq!(mdi.partition_count("idx").await.unwrap(), 2);

        let siblings = mdi.lookup_siblings("idx", &[key("m"), key("z")]).await.unwrap();
        assert!(siblings.iter().all(|l| l.partition_id == 1));
    }

    #[tokio::test]
    async fn test_lookup_failure() {
        let mdi = MemoryMetadataIndex::new();
        mdi.create_index("idx", NodeId::new()).unwrap();
        mdi.set_fail_lookups(true);
        assert!(matches!(
            mdi.lookup_siblings("idx", &[key("a")]).await,
            Err(Error::Lookup(_))
        ));
    }

    #[tokio::test]
    async fn test_split_join_move() {
        let mdi = MemoryMetadataIndex::new();
        let node = NodeId::new();
        let old = mdi.create_index("idx", node).unwrap();

        let left = PartitionLocator::new(1, node, KeyRange::new(Bytes::new(), Some(key("m"))));
        let right = PartitionLocator::new(2, node, KeyRange::new(key("m"), None));
        mdi.split_shard("idx", &old, &[left.clone(), right.clone()])
            .await
            .unwrap();
        assert_eq!(mdi.locators("idx").len(), 2);

        // the old locator no longer matches
        assert!(mdi.split_shard("idx", &old, &[old.clone()]).await.is_err());

        let other = NodeId::new();
        let moved = PartitionLocator::new(3, other, right.range.clone());
        mdi.move_shard("idx", &right, &moved).await.unwrap();
        assert_eq!(mdi.locate("idx", b"x").await.unwrap().node, other);
        assert!(mdi.move_shard("idx", &right, &moved).await.is_err());
        assert_eq!(mdi.move_count(), 1);

        let moved_back = PartitionLocator::new(3, node, right.range.clone());
        mdi.move_shard("idx", &moved, &moved_back).await.unwrap();

        let joined = PartitionLocator::new(4, node, KeyRange::full());
        mdi.join_shards("idx", &[left, moved_back], &joined)
            .await
            .unwrap();
        assert_eq!(mdi.locators("idx"), vec![joined]);
    }

    #[tokio::test]
    async fn test_split_must_tile_old_range() {
        let mdi = MemoryMetadataIndex::new();
        let node = NodeId::new();
        let old = mdi.create_index("idx", node).unwrap();
        let gap = [
            PartitionLocator::new(1, node, KeyRange::new(Bytes::new(), Some(key("f")))),
            PartitionLocator::new(2, node, KeyRange::new(key("g"), None)),
        ];
        assert!(mdi.split_shard("idx", &old, &gap).await.is_err());
        assert_eq!(mdi.locators("idx"), vec![old]);
    }
}
