//! Error types for spanstore
//!
//! This module defines the common error type shared by the storage
//! substrate, the cluster clients and the overflow engine.

use crate::types::StaleLocatorReason;
use thiserror::Error;

/// Common result type for spanstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for spanstore
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk is full")]
    DiskFull,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("shard already exists: {0}")]
    ShardExists(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// The shard name was retired by a split, join or move. Clients must
    /// re-resolve the key against the metadata index.
    #[error("stale locator: {name} ({reason})")]
    StaleLocator {
        name: String,
        reason: StaleLocatorReason,
    },

    // Cluster errors
    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("metadata index error: {0}")]
    MetadataIndex(String),

    #[error("resource transfer failed: {0}")]
    Transfer(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    // Lifecycle errors
    #[error("interrupted")]
    Interrupted,

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("cancelled")]
    Cancelled,

    // General errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a stale locator error
    pub fn stale_locator(name: impl Into<String>, reason: StaleLocatorReason) -> Self {
        Self::StaleLocator {
            name: name.into(),
            reason,
        }
    }

    /// Check if this error is retryable
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transfer(_) | Self::Lookup(_) | Self::StaleLocator { .. }
        )
    }

    /// Check if this error tells the caller to refresh its locator
    #[must_use]
    pub const fn is_stale_locator(&self) -> bool {
        matches!(self, Self::StaleLocator { .. })
    }

    /// Check if this error is a "not found" error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ShardNotFound(_) | Self::ArtifactNotFound(_) | Self::NodeNotFound(_)
        )
    }

    /// Check if this error was raised because the service is stopping.
    ///
    /// These outcomes are logged at a lower severity and are not counted as
    /// task failures.
    #[must_use]
    pub const fn is_normal_shutdown(&self) -> bool {
        matches!(
            self,
            Self::Interrupted | Self::ChannelClosed(_) | Self::ShuttingDown
        )
    }
}
