//! Retention holds on newly built artifacts
//!
//! An artifact produced by an overflow task is not referenced by any shard
//! view until the task's atomic update commits. Until then the release
//! policy would see it as garbage. Tasks therefore hold every artifact they
//! create in the node's [`RetentionSet`] and the release sweep skips held
//! artifacts.

use dashmap::DashSet;
use spanstore_common::ArtifactId;
use std::sync::Arc;

/// Set of artifacts that must not be released.
///
/// Holds are idempotent and not reference counted: adding an id twice and
/// removing it once releases it.
#[derive(Debug, Default)]
pub struct RetentionSet {
    held: DashSet<ArtifactId>,
}

impl RetentionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold an artifact. Returns false if it was already held.
    pub fn add(&self, id: ArtifactId) -> bool {
        self.held.insert(id)
    }

    /// Release a hold. Returns false if the artifact was not held.
    pub fn remove(&self, id: &ArtifactId) -> bool {
        self.held.remove(id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.held.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Start a scoped hold that releases everything it adopted on drop
    #[must_use]
    pub fn hold(self: &Arc<Self>) -> RetentionHold {
        RetentionHold {
            set: Arc::clone(self),
            ids: Vec::new(),
        }
    }
}

/// Scoped set of retention holds owned by one task.
///
/// Dropping the hold releases every adopted artifact, whether the task
/// committed or failed.
#[derive(Debug)]
pub struct RetentionHold {
    set: Arc<RetentionSet>,
    ids: Vec<ArtifactId>,
}

impl RetentionHold {
    /// Hold `id` until this guard is dropped
    pub fn adopt(&mut self, id: ArtifactId) {
        self.set.add(id);
        if !self.ids.contains(&id) {
            self.ids.push(id);
        }
    }

    /// Artifacts held by this guard
    #[must_use]
    pub fn ids(&self) -> &[ArtifactId] {
        &self.ids
    }
}

impl Drop for RetentionHold {
    fn drop(&mut self) {
        for id in &self.ids {
            self.set.remove(id);
        }
    }
}
