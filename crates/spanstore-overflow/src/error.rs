//! Error types for overflow processing

use spanstore_common::ShardName;
use thiserror::Error;

/// Result type for overflow operations
pub type OverflowResult<T> = std::result::Result<T, OverflowError>;

/// Errors raised while planning or running overflow tasks
#[derive(Debug, Error)]
pub enum OverflowError {
    /// A shard in the overflow snapshot has no view at the snapshot time
    #[error("no view for {0} at the overflow commit time")]
    MissingView(ShardName),

    #[error("shards are not adjacent siblings: {left} then {right}")]
    NotAdjacent { left: ShardName, right: ShardName },

    #[error("move in progress for {0}")]
    MoveInProgress(ShardName),

    #[error("cannot move {0} onto the node that owns it")]
    MoveToSelf(ShardName),

    #[error("cannot split {name}: {reason}")]
    SplitRefused { name: ShardName, reason: String },

    /// The live definition no longer derives from the snapshot view
    #[error("view of {0} changed since the overflow snapshot")]
    ViewChanged(ShardName),

    #[error(transparent)]
    Common(#[from] spanstore_common::Error),
}

impl OverflowError {
    pub fn split_refused(name: &ShardName, reason: impl Into<String>) -> Self {
        Self::SplitRefused {
            name: name.clone(),
            reason: reason.into(),
        }
    }

    /// Errors raised because the node is going away
    #[must_use]
    pub const fn is_normal_shutdown(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_normal_shutdown())
    }

    /// True for precondition failures detected before any state changed
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotAdjacent { .. }
                | Self::MoveInProgress(_)
                | Self::MoveToSelf(_)
                | Self::SplitRefused { .. }
        )
    }
}
