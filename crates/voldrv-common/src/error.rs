//! Error types for voldrv
//!
//! This module defines the common error type used throughout the snapshot,
//! backend and metadata store crates.

use crate::types::{SnapshotName, TLogId};
use thiserror::Error;

/// Common result type for voldrv operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for voldrv
#[derive(Debug, Error)]
pub enum Error {
    // Snapshot API misuse
    #[error("snapshot already exists: {0}")]
    SnapshotNameAlreadyExists(SnapshotName),

    #[error("snapshot metadata too large: {size} bytes, max {max} bytes")]
    MetadataTooLarge { size: usize, max: usize },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Scrubbing
    #[error("snapshot {0} has changed, cannot apply scrub result")]
    ReplaceMismatch(SnapshotName),

    #[error("scrub result for snapshot {0} contains no tlogs")]
    EmptyReplacement(SnapshotName),

    // Consistency / corruption
    #[error("tlog {tlog} marked written to backend while {predecessor} is not")]
    OrderingViolation { tlog: TLogId, predecessor: TLogId },

    #[error("unsupported {what} version {found}, expected {expected}")]
    UnsupportedVersion {
        what: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("cork {0} found but not written to backend")]
    CorkNotOnBackend(TLogId),

    // Cork protocol
    #[error("cork not found: {0}")]
    CorkNotFound(String),

    // Infrastructure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object not found: {namespace}/{name}")]
    ObjectNotFound { namespace: String, name: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("metadata store error: {0}")]
    MetaDataStore(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a snapshot not found error
    pub fn snapshot_not_found(what: impl std::fmt::Display) -> Self {
        Self::SnapshotNotFound(what.to_string())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a metadata store error
    pub fn meta_data_store(msg: impl Into<String>) -> Self {
        Self::MetaDataStore(msg.into())
    }

    /// Create a deserialization error
    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SnapshotNotFound(_) | Self::ObjectNotFound { .. }
        )
    }

    /// Check if this error signals on-disk corruption or version skew.
    ///
    /// These must never be worked around by callers.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::OrderingViolation { .. }
                | Self::UnsupportedVersion { .. }
                | Self::Deserialization(_)
                | Self::CorkNotOnBackend(_)
        )
    }

    /// Check if this is the cork resolution failure that callers may retry
    /// from an empty cork
    #[must_use]
    pub const fn is_cork_not_found(&self) -> bool {
        matches!(self, Self::CorkNotFound(_))
    }

    /// Check if the caller may retry the call with corrected arguments
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::SnapshotNameAlreadyExists(_)
                | Self::MetadataTooLarge { .. }
                | Self::SnapshotNotFound(_)
                | Self::InvalidRange(_)
                | Self::InvalidArgument(_)
        )
    }
}
