//! Exclusive per-shard locks
//!
//! Atomic updates and client writes serialize on the shard names they
//! touch. Names are always acquired in sorted order so that tasks locking
//! several shards cannot deadlock each other.

use dashmap::DashMap;
use spanstore_common::ShardName;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-shard exclusive locks
#[derive(Default)]
pub struct LockManager {
    locks: DashMap<ShardName, Arc<Mutex<()>>>,
}

/// Guards for a set of shard names; released on drop
pub struct ShardLocks {
    names: Vec<ShardName>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl ShardLocks {
    /// Locked names in acquisition order
    #[must_use]
    pub fn names(&self) -> &[ShardName] {
        &self.names
    }
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the locks for `names`
    pub async fn lock(&self, names: &[ShardName]) -> ShardLocks {
        let mut names = names.to_vec();
        names.sort();
        names.dedup();

        let mut guards = Vec::with_capacity(names.len());
        for name in &names {
            let mutex = Arc::clone(self.locks.entry(name.clone()).or_default().value());
            guards.push(mutex.lock_owned().await);
        }
        ShardLocks {
            names,
            _guards: guards,
        }
    }

    /// True if some task holds the lock for `name`
    #[must_use]
    pub fn is_locked(&self, name: &ShardName) -> bool {
        self.locks
            .get(name)
            .is_some_and(|m| m.value().try_lock().is_err())
    }

    /// Forget locks for retired names that nobody holds
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
