//! In-memory storage engine
//!
//! Reference implementation of [`ShardStore`] that keeps journals and
//! segments in memory. It follows the same lifecycle as a disk-backed store:
//! writes land on the live journal, synchronous overflow closes it and
//! snapshots the committed shard definitions, and segments are immutable
//! once built.

use crate::retention::RetentionSet;
use crate::stale::StaleLocatorCache;
use crate::store::{
    ArtifactPayload, OverflowSnapshot, ShardDefinition, ShardStore, SourceRef, WriteCounters,
};
use crate::view::{Entry, Source, Tree, View, tree_bytes};
use bytes::Bytes;
use parking_lot::RwLock;
use spanstore_common::{
    ArtifactId, ArtifactKind, ArtifactMetadata, CommitTime, Error, KeyRange, OverflowConfig,
    Result, ShardName,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

struct Journal {
    closed: bool,
    trees: HashMap<ShardName, Arc<Tree>>,
}

impl Journal {
    fn open() -> Self {
        Self {
            closed: false,
            trees: HashMap::new(),
        }
    }
}

struct Segment {
    metadata: ArtifactMetadata,
    entries: Arc<Tree>,
}

struct StoreState {
    clock: CommitTime,
    live_journal: ArtifactId,
    live_bytes: u64,
    journals: HashMap<ArtifactId, Journal>,
    segments: HashMap<ArtifactId, Segment>,
    shards: BTreeMap<ShardName, ShardDefinition>,
    /// Committed definitions captured at each synchronous overflow
    history: BTreeMap<CommitTime, BTreeMap<ShardName, ShardDefinition>>,
    counters: HashMap<ShardName, WriteCounters>,
}

impl StoreState {
    fn resolve(&self, def: &ShardDefinition, commit_time: CommitTime) -> Result<View> {
        let mut sources = Vec::with_capacity(def.sources.len());
        for source in &def.sources {
            let resolved = match source {
                SourceRef::Journal(id) => {
                    let journal = self
                        .journals
                        .get(id)
                        .ok_or_else(|| Error::ArtifactNotFound(id.to_string()))?;
                    let tree = journal.trees.get(&def.name).cloned().unwrap_or_default();
                    Source {
                        source: *source,
                        byte_len: tree_bytes(&tree),
                        tree,
                    }
                }
                SourceRef::Segment(id) => {
                    let segment = self
                        .segments
                        .get(id)
                        .ok_or_else(|| Error::ArtifactNotFound(id.to_string()))?;
                    Source {
                        source: *source,
                        byte_len: segment.metadata.byte_len,
                        tree: Arc::clone(&segment.entries),
                    }
                }
            };
            sources.push(resolved);
        }
        Ok(View::new(
            def.name.clone(),
            def.range.clone(),
            commit_time,
            sources,
        ))
    }

    fn validate(&self, def: &ShardDefinition) -> Result<()> {
        if def.sources.first() != Some(&SourceRef::Journal(self.live_journal)) {
            return Err(Error::invalid_argument(format!(
                "definition of {} must start with the live journal",
                def.name
            )));
        }
        for source in &def.sources[1..] {
            let known = match source {
                SourceRef::Journal(id) => self.journals.contains_key(id),
                SourceRef::Segment(id) => self.segments.contains_key(id),
            };
            if !known {
                return Err(Error::ArtifactNotFound(source.id().to_string()));
            }
        }
        Ok(())
    }

    fn live_tree_mut(&mut self, name: &ShardName) -> Result<&mut Tree> {
        let live = self.live_journal;
        let journal = self
            .journals
            .get_mut(&live)
            .ok_or_else(|| Error::internal("live journal missing"))?;
        Ok(Arc::make_mut(journal.trees.entry(name.clone()).or_default()))
    }
}

/// In-memory [`ShardStore`]
pub struct MemoryStore {
    data_dir: PathBuf,
    max_journal_bytes: u64,
    retention: Arc<RetentionSet>,
    stale: Arc<StaleLocatorCache>,
    state: RwLock<StoreState>,
    fail_builds: AtomicBool,
    fail_drops: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store with a fresh live journal
    pub fn new(
        data_dir: impl Into<PathBuf>,
        max_journal_bytes: u64,
        retention: Arc<RetentionSet>,
        stale: Arc<StaleLocatorCache>,
    ) -> Self {
        let live = ArtifactId::new();
        let mut journals = HashMap::new();
        journals.insert(live, Journal::open());
        Self {
            data_dir: data_dir.into(),
            max_journal_bytes: max_journal_bytes.max(1),
            retention,
            stale,
            state: RwLock::new(StoreState {
                clock: 0,
                live_journal: live,
                live_bytes: 0,
                journals,
                segments: HashMap::new(),
                shards: BTreeMap::new(),
                history: BTreeMap::new(),
                counters: HashMap::new(),
            }),
            fail_builds: AtomicBool::new(false),
            fail_drops: AtomicBool::new(false),
        }
    }

    /// Make every subsequent segment build fail as if the disk were full
    pub fn set_fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent shard drop fail
    pub fn set_fail_drops(&self, fail: bool) {
        self.fail_drops.store(fail, Ordering::SeqCst);
    }

    /// Number of stored segments
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Number of stored journals, including the live one
    #[must_use]
    pub fn journal_count(&self) -> usize {
        self.state.read().journals.len()
    }

    /// Retention set consulted by the release sweep
    #[must_use]
    pub const fn retention(&self) -> &Arc<RetentionSet> {
        &self.retention
    }

    /// Cache of retired shard names
    #[must_use]
    pub const fn stale_locators(&self) -> &Arc<StaleLocatorCache> {
        &self.stale
    }

    fn segment_path(&self, name: &ShardName, id: ArtifactId) -> PathBuf {
        self.data_dir
            .join(name.index())
            .join(name.partition_id().to_string())
            .join(format!("{id}.seg"))
    }
}

impl ShardStore for MemoryStore {
    fn live_journal(&self) -> ArtifactId {
        self.state.read().live_journal
    }

    fn last_commit_time(&self) -> CommitTime {
        self.state.read().clock
    }

    #[allow(clippy::cast_precision_loss)]
    fn journal_extent(&self) -> f64 {
        self.state.read().live_bytes as f64 / self.max_journal_bytes as f64
    }

    fn overflow(&self, config: &OverflowConfig) -> Result<OverflowSnapshot> {
        let mut st = self.state.write();
        let last_commit_time = st.clock;
        let old = st.live_journal;
        let new = ArtifactId::new();

        let committed = st.shards.clone();
        st.history.insert(last_commit_time, committed.clone());

        let old_trees = match st.journals.get_mut(&old) {
            Some(journal) => {
                journal.closed = true;
                journal.trees.clone()
            }
            None => return Err(Error::internal("live journal missing")),
        };

        let mut next = Journal::open();
        let mut copied = BTreeSet::new();
        let mut live_bytes = 0;
        for (name, def) in &committed {
            let buffered = old_trees.get(name).cloned().unwrap_or_default();
            let journals = def.sources.iter().filter(|s| s.is_journal()).count();
            let segments = def.sources.len() - journals;
            let mandatory_merge = config.is_mandatory_merge(journals, segments);

            let mut sources = vec![SourceRef::Journal(new)];
            if config.should_copy(buffered.len() as u64, mandatory_merge) {
                live_bytes += tree_bytes(&buffered);
                next.trees.insert(name.clone(), Arc::new((*buffered).clone()));
                sources.extend(def.sources.iter().filter(|s| **s != SourceRef::Journal(old)));
                copied.insert(name.clone());
            } else {
                sources.extend(def.sources.iter().copied());
            }
            if let Some(live) = st.shards.get_mut(name) {
                live.sources = sources;
            }
        }

        st.journals.insert(new, next);
        st.live_journal = new;
        st.live_bytes = live_bytes;

        info!(
            "Synchronous overflow at commit time {last_commit_time}: {} shards, {} copied",
            committed.len(),
            copied.len()
        );

        Ok(OverflowSnapshot {
            last_commit_time,
            old_journal: old,
            new_journal: new,
            shards: committed.keys().cloned().collect(),
            copied,
        })
    }

    fn shard_names(&self) -> Vec<ShardName> {
        self.state.read().shards.keys().cloned().collect()
    }

    fn shard_definition(&self, name: &ShardName) -> Option<ShardDefinition> {
        self.state.read().shards.get(name).cloned()
    }

    fn open_historical_view(
        &self,
        name: &ShardName,
        timestamp: CommitTime,
    ) -> Result<Option<View>> {
        let st = self.state.read();
        let Some((_, defs)) = st.history.range(..=timestamp).next_back() else {
            return Ok(None);
        };
        defs.get(name)
            .map(|def| st.resolve(def, timestamp))
            .transpose()
    }

    fn open_live_view(&self, name: &ShardName) -> Result<View> {
        let st = self.state.read();
        match st.shards.get(name) {
            Some(def) => st.resolve(def, st.clock),
            None => Err(self.stale.not_found_error(name)),
        }
    }

    fn live_journal_view(&self, name: &ShardName) -> Result<View> {
        let st = self.state.read();
        let def = st
            .shards
            .get(name)
            .ok_or_else(|| self.stale.not_found_error(name))?;
        let journal_only = ShardDefinition {
            sources: vec![SourceRef::Journal(st.live_journal)],
            ..def.clone()
        };
        st.resolve(&journal_only, st.clock)
    }

    fn build_artifact(
        &self,
        view: &View,
        compacting: bool,
        commit_time: CommitTime,
        from: &[u8],
        to: Option<&[u8]>,
    ) -> Result<ArtifactMetadata> {
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(Error::DiskFull);
        }

        let mut entries = view.range_entries(from, to);
        if compacting {
            entries.retain(|_, e| !e.is_deleted());
        }

        let id = ArtifactId::new();
        let metadata = ArtifactMetadata {
            id,
            kind: ArtifactKind::Segment,
            path: self.segment_path(view.name(), id),
            commit_time,
            byte_len: tree_bytes(&entries),
            entry_count: entries.len() as u64,
        };

        let mut st = self.state.write();
        self.retention.add(id);
        st.segments.insert(
            id,
            Segment {
                metadata: metadata.clone(),
                entries: Arc::new(entries),
            },
        );
        debug!(
            "Built segment {id} for {} ({} tuples, compacting={compacting})",
            view.name(),
            metadata.entry_count
        );
        Ok(metadata)
    }

    fn artifact(&self, id: &ArtifactId) -> Option<ArtifactMetadata> {
        self.state
            .read()
            .segments
            .get(id)
            .map(|s| s.metadata.clone())
    }

    fn read_artifact(&self, id: &ArtifactId) -> Result<ArtifactPayload> {
        let st = self.state.read();
        let segment = st
            .segments
            .get(id)
            .ok_or_else(|| Error::ArtifactNotFound(id.to_string()))?;
        Ok(ArtifactPayload {
            metadata: segment.metadata.clone(),
            entries: Arc::clone(&segment.entries),
        })
    }

    fn install_artifact(&self, payload: ArtifactPayload) -> Result<ArtifactMetadata> {
        let mut metadata = payload.metadata;
        let file_name = metadata
            .path
            .file_name()
            .map_or_else(|| format!("{}.seg", metadata.id).into(), ToOwned::to_owned);
        metadata.path = self.data_dir.join("received").join(file_name);

        let mut st = self.state.write();
        self.retention.add(metadata.id);
        st.segments
            .entry(metadata.id)
            .or_insert_with(|| Segment {
                metadata: metadata.clone(),
                entries: payload.entries,
            });
        Ok(metadata)
    }

    fn delete_artifact(&self, id: &ArtifactId) -> Result<()> {
        let mut st = self.state.write();
        st.segments
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::ArtifactNotFound(id.to_string()))
    }

    fn register_shard(&self, definition: ShardDefinition, seed: Option<Tree>) -> Result<()> {
        let mut st = self.state.write();
        if st.shards.contains_key(&definition.name) {
            return Err(Error::ShardExists(definition.name.to_string()));
        }
        st.validate(&definition)?;

        let name = definition.name.clone();
        let seed = seed.unwrap_or_default();
        st.live_bytes += tree_bytes(&seed);
        *st.live_tree_mut(&name)? = seed;
        st.counters.insert(name.clone(), WriteCounters::default());
        st.shards.insert(name, definition);
        Ok(())
    }

    fn replace_definition(&self, definition: ShardDefinition) -> Result<()> {
        let mut st = self.state.write();
        if !st.shards.contains_key(&definition.name) {
            return Err(Error::ShardNotFound(definition.name.to_string()));
        }
        st.validate(&definition)?;
        st.shards.insert(definition.name.clone(), definition);
        Ok(())
    }

    fn drop_shard(&self, name: &ShardName) -> Result<()> {
        if self.fail_drops.load(Ordering::SeqCst) {
            return Err(Error::internal(format!("cannot drop {name}")));
        }
        let mut st = self.state.write();
        if st.shards.remove(name).is_none() {
            return Err(Error::ShardNotFound(name.to_string()));
        }
        let live = st.live_journal;
        if let Some(journal) = st.journals.get_mut(&live) {
            journal.trees.remove(name);
        }
        st.counters.remove(name);
        Ok(())
    }

    fn copy_live_writes(
        &self,
        from: &ShardName,
        to: &ShardName,
        range: &KeyRange,
    ) -> Result<u64> {
        let mut st = self.state.write();
        for name in [from, to] {
            if !st.shards.contains_key(name) {
                return Err(Error::ShardNotFound(name.to_string()));
            }
        }
        let source: Vec<(Bytes, Entry)> = st
            .journals
            .get(&st.live_journal)
            .and_then(|j| j.trees.get(from))
            .map(|tree| {
                tree.iter()
                    .filter(|(k, _)| range.contains(k))
                    .map(|(k, e)| (k.clone(), e.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let copied = source.len() as u64;
        let added: u64 = source.iter().map(|(k, e)| e.encoded_len(k)).sum();
        let dest = st.live_tree_mut(to)?;
        dest.extend(source);
        st.live_bytes += added;
        Ok(copied)
    }

    fn write(&self, name: &ShardName, key: Bytes, value: Option<Bytes>) -> Result<CommitTime> {
        let mut st = self.state.write();
        let def = st
            .shards
            .get(name)
            .ok_or_else(|| self.stale.not_found_error(name))?;
        if !def.range.contains(&key) {
            return Err(Error::invalid_argument(format!(
                "key outside the range {} of {name}",
                def.range
            )));
        }

        let (visible, append) = {
            let view = st.resolve(def, st.clock)?;
            let right_most = view
                .sources()
                .iter()
                .filter_map(|s| s.tree.keys().next_back())
                .max();
            (
                view.lookup(&key).is_some(),
                right_most.is_none_or(|max| key > *max),
            )
        };

        st.clock += 1;
        let version = st.clock;
        let entry = match value {
            Some(v) => Entry::value(v, version),
            None => Entry::deleted(version),
        };
        let bytes = entry.encoded_len(&key);
        let deleted = entry.is_deleted();
        st.live_tree_mut(name)?.insert(key, entry);
        st.live_bytes += bytes;

        let counters = st.counters.entry(name.clone()).or_default();
        counters.bytes_written += bytes;
        if deleted {
            counters.removes += 1;
        } else {
            counters.inserts += 1;
            if !visible {
                counters.new_keys += 1;
                if append {
                    counters.appends += 1;
                }
            }
        }
        Ok(version)
    }

    fn write_counters(&self) -> HashMap<ShardName, WriteCounters> {
        self.state.read().counters.clone()
    }

    fn purge_unused(&self) -> Vec<ArtifactId> {
        let mut st = self.state.write();

        while st.history.len() > 1 {
            st.history.pop_first();
        }

        let mut referenced: HashSet<ArtifactId> = HashSet::new();
        referenced.insert(st.live_journal);
        for def in st.shards.values().chain(st.history.values().flat_map(BTreeMap::values)) {
            referenced.extend(def.sources.iter().map(SourceRef::id));
        }

        let released_segments: Vec<ArtifactId> = st
            .segments
            .keys()
            .filter(|id| !referenced.contains(*id) && !self.retention.contains(id))
            .copied()
            .collect();
        let released_journals: Vec<ArtifactId> = st
            .journals
            .iter()
            .filter(|(id, j)| j.closed && !referenced.contains(*id) && !self.retention.contains(id))
            .map(|(id, _)| *id)
            .collect();

        for id in &released_segments {
            st.segments.remove(id);
        }
        for id in &released_journals {
            st.journals.remove(id);
        }

        let released: Vec<ArtifactId> = released_segments
            .into_iter()
            .chain(released_journals)
            .collect();
        if !released.is_empty() {
            debug!("Released {} unused artifacts", released.len());
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanstore_common::StaleLocatorReason;

    fn store() -> MemoryStore {
        MemoryStore::new(
            "/tmp/spanstore-test",
            1024 * 1024,
            Arc::new(RetentionSet::new()),
            Arc::new(StaleLocatorCache::new(16)),
        )
    }

    fn register(store: &MemoryStore, name: &ShardName) {
        let def = ShardDefinition::on_journal(name.clone(), KeyRange::full(), store.live_journal());
        store.register_shard(def, None).unwrap();
    }

    fn put(store: &MemoryStore, name: &ShardName, key: &str, value: &str) {
        store
            .write(
                name,
                Bytes::copy_from_slice(key.as_bytes()),
                Some(Bytes::copy_from_slice(value.as_bytes())),
            )
            .unwrap();
    }

    #[test]
    fn test_write_and_read() {
        let store = store();
        let name = ShardName::new("idx", 0);
        register(&store, &name);
        put(&store, &name, "a", "1");
        put(&store, &name, "b", "2");
        store.write(&name, Bytes::from_static(b"a"), None).unwrap();

        let view = store.open_live_view(&name).unwrap();
        assert_eq!(view.lookup(b"a"), None);
        assert_eq!(view.lookup(b"b"), Some(Bytes::from_static(b"2")));

        let counters = store.write_counters()[&name];
        assert_eq!(counters.inserts, 2);
        assert_eq!(counters.removes, 1);
        assert_eq!(counters.appends, 2);
    }

    #[test]
    fn test_append_detection() {
        let store = store();
        let name = ShardName::new("idx", 0);
        register(&store, &name);
        put(&store, &name, "m", "1");
        put(&store, &name, "a", "1");
        put(&store, &name, "z", "1");
        put(&store, &name, "z", "2");

        let counters = store.write_counters()[&name];
        assert_eq!(counters.new_keys, 3);
        assert_eq!(counters.appends, 2);
    }

    #[test]
    fn test_overflow_copies_small_shards() {
        let store = store();
        let small = ShardName::new("idx", 0);
        let big = ShardName::new("idx", 1);
        register(&store, &small);
        register(&store, &big);
        put(&store, &small, "a", "1");
        for i in 0..20 {
            put(&store, &big, &format!("k{i:03}"), "v");
        }

        let config = OverflowConfig {
            copy_index_threshold: 5,
            ..OverflowConfig::default()
        };
        let snapshot = store.overflow(&config).unwrap();

        assert!(snapshot.copied.contains(&small));
        assert!(!snapshot.copied.contains(&big));
        assert_eq!(store.shard_definition(&small).unwrap().sources.len(), 1);
        assert_eq!(store.shard_definition(&big).unwrap().sources.len(), 2);
        assert_eq!(
            store.open_live_view(&small).unwrap().lookup(b"a"),
            Some(Bytes::from_static(b"1"))
        );

        let historical = store
            .open_historical_view(&big, snapshot.last_commit_time)
            .unwrap()
            .unwrap();
        assert_eq!(historical.journal_count(), 1);
        assert_eq!(historical.live_keys().len(), 20);
        assert!(store.open_historical_view(&big, 0).unwrap().is_none());
    }

    #[test]
    fn test_build_artifact_is_retained_until_released() {
        let store = store();
        let name = ShardName::new("idx", 0);
        register(&store, &name);
        put(&store, &name, "a", "1");
        let view = store.open_live_view(&name).unwrap();

        let artifact = store.build_artifact(&view, true, 1, b"", None).unwrap();
        assert!(store.retention().contains(&artifact.id));
        assert!(artifact.path.ends_with(format!("idx/0/{}.seg", artifact.id)));

        assert!(store.purge_unused().is_empty());
        assert!(store.artifact(&artifact.id).is_some());

        store.retention().remove(&artifact.id);
        assert_eq!(store.purge_unused(), vec![artifact.id]);
        assert!(store.artifact(&artifact.id).is_none());
    }

    #[test]
    fn test_concurrent_sweep_never_releases_held_artifact() {
        let store = Arc::new(store());
        let name = ShardName::new("idx", 0);
        register(&store, &name);
        put(&store, &name, "a", "1");
        let view = store.open_live_view(&name).unwrap();

        let sweeper = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let mut released = Vec::new();
                for _ in 0..200 {
                    released.extend(store.purge_unused());
                }
                released
            })
        };

        let mut built = Vec::new();
        for _ in 0..50 {
            let artifact = store.build_artifact(&view, false, 1, b"", None).unwrap();
            assert!(store.artifact(&artifact.id).is_some());
            built.push(artifact.id);
        }
        let released = sweeper.join().unwrap();
        assert!(released.iter().all(|id| !built.contains(id)));
    }

    #[test]
    fn test_failed_build_leaves_nothing() {
        let store = store();
        let name = ShardName::new("idx", 0);
        register(&store, &name);
        let view = store.open_live_view(&name).unwrap();

        store.set_fail_builds(true);
        assert!(matches!(
            store.build_artifact(&view, true, 1, b"", None),
            Err(Error::DiskFull)
        ));
        assert_eq!(store.segment_count(), 0);
        assert!(store.retention().is_empty());
    }

    #[test]
    fn test_dropped_shard_reports_stale() {
        let store = store();
        let name = ShardName::new("idx", 0);
        register(&store, &name);
        store.drop_shard(&name).unwrap();
        assert!(matches!(
            store.open_live_view(&name),
            Err(Error::ShardNotFound(_))
        ));

        store
            .stale_locators()
            .insert(name.clone(), StaleLocatorReason::Move);
        assert!(store.open_live_view(&name).unwrap_err().is_stale_locator());
        assert!(
            store
                .write(&name, Bytes::from_static(b"a"), None)
                .unwrap_err()
                .is_stale_locator()
        );
    }

    #[test]
    fn test_register_requires_live_journal_first() {
        let store = store();
        let def = ShardDefinition::on_journal(
            ShardName::new("idx", 0),
            KeyRange::full(),
            ArtifactId::new(),
        );
        assert!(matches!(
            store.register_shard(def, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_copy_live_writes_within_range() {
        let store = store();
        let from = ShardName::new("idx", 0);
        let to = ShardName::new("idx", 1);
        register(&store, &from);
        register(&store, &to);
        put(&store, &from, "a", "1");
        put(&store, &from, "m", "2");
        store.write(&from, Bytes::from_static(b"n"), None).unwrap();

        let range = KeyRange::new(Bytes::from_static(b"m"), None);
        assert_eq!(store.copy_live_writes(&from, &to, &range).unwrap(), 2);
        let view = store.live_journal_view(&to).unwrap();
        assert_eq!(view.lookup(b"m"), Some(Bytes::from_static(b"2")));
        assert_eq!(view.lookup(b"a"), None);
        assert_eq!(view.range_count(b"", None), 2);
    }

    #[test]
    fn test_purge_releases_closed_journals() {
        let store = store();
        let name = ShardName::new("idx", 0);
        register(&store, &name);
        put(&store, &name, "a", "1");

        let config = OverflowConfig {
            copy_index_threshold: 0,
            ..OverflowConfig::default()
        };
        let first = store.overflow(&config).unwrap();
        let view = store
            .open_historical_view(&name, first.last_commit_time)
            .unwrap()
            .unwrap();
        let artifact = store
            .build_artifact(&view, false, first.last_commit_time, b"", None)
            .unwrap();
        let def = store.shard_definition(&name).unwrap();
        store
            .replace_definition(ShardDefinition {
                sources: vec![def.sources[0], SourceRef::Segment(artifact.id)],
                ..def
            })
            .unwrap();
        store.retention().remove(&artifact.id);

        // the old journal is still pinned by the latest historical snapshot
        assert!(store.purge_unused().is_empty());

        put(&store, &name, "b", "2");
        store.overflow(&config).unwrap();
        let released = store.purge_unused();
        assert!(released.contains(&first.old_journal));
        assert!(store.artifact(&artifact.id).is_some());
    }
}
