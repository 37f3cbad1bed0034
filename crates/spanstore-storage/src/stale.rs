//! Cache of retired shard names
//!
//! When a shard is split, joined or moved its name stops resolving to a live
//! view. Recording the reason lets the node answer requests for that name
//! with a typed stale-locator error instead of a plain not-found, so clients
//! know to refresh their locator. Entries age out in LRU order; after that a
//! request for the retired name sees not-found.

use lru::LruCache;
use parking_lot::Mutex;
use spanstore_common::{Error, Result, ShardName, StaleLocatorReason};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stale-locator cache statistics
#[derive(Debug, Default)]
pub struct StaleLocatorStats {
    /// Names retired
    pub inserts: AtomicU64,
    /// Lookups answered with a stale reason
    pub hits: AtomicU64,
    /// Lookups for names not in the cache
    pub misses: AtomicU64,
}

/// Bounded LRU of retired shard names
pub struct StaleLocatorCache {
    entries: Mutex<LruCache<ShardName, StaleLocatorReason>>,
    stats: StaleLocatorStats,
}

impl StaleLocatorCache {
    /// Create a cache holding at most `capacity` names (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            stats: StaleLocatorStats::default(),
        }
    }

    /// Record that `name` was retired for `reason`
    pub fn insert(&self, name: ShardName, reason: StaleLocatorReason) {
        self.entries.lock().put(name, reason);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reason `name` was retired, if it is still remembered
    pub fn get(&self, name: &ShardName) -> Option<StaleLocatorReason> {
        let reason = self.entries.lock().get(name).copied();
        if reason.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        reason
    }

    /// Fail with [`Error::StaleLocator`] if `name` was retired
    pub fn check(&self, name: &ShardName) -> Result<()> {
        match self.get(name) {
            Some(reason) => Err(Error::stale_locator(name.to_string(), reason)),
            None => Ok(()),
        }
    }

    /// Error to report for a name with no live definition
    pub fn not_found_error(&self, name: &ShardName) -> Error {
        match self.get(name) {
            Some(reason) => Error::stale_locator(name.to_string(), reason),
            None => Error::ShardNotFound(name.to_string()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Get cache statistics
    pub const fn stats(&self) -> &StaleLocatorStats {
        &self.stats
    }
}
