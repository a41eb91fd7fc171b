//! Core type definitions for voldrv
//!
//! Identifiers shared by the snapshot chain, the backend and the metadata
//! store: TLog ids (which double as corks), snapshot names, scrub ids,
//! backend namespaces and clone depths.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum size of the opaque metadata attached to a snapshot
pub const MAX_SNAPSHOT_METADATA_SIZE: usize = 4096;

/// Name of the persisted snapshot chain, both on disk and on the backend
pub const SNAPSHOTS_FILENAME: &str = "snapshots.xml";

const TLOG_NAME_PREFIX: &str = "tlog_";

/// Snapshot sequence number, strictly increasing within a chain
pub type SnapshotNum = u32;

/// Opaque metadata attached to a snapshot by its creator
pub type SnapshotMetaData = Vec<u8>;

/// TLog ids ordered oldest first
pub type OrderedTLogIds = Vec<TLogId>;

/// TLog ids per clone level, oldest level first
pub type CloneTLogs = Vec<(SCOCloneId, OrderedTLogIds)>;

/// Identifier of a write-ahead log segment.
///
/// The same value is used as a cork: "everything up to and including this
/// TLog is known to be durable".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct TLogId(Uuid);

impl TLogId {
    /// Generate a new random TLog ID
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

    /// Backend object name of this TLog (`tlog_<uuid>`)
    #[must_use]
    pub fn name(&self) -> String {
        format!("{TLOG_NAME_PREFIX}{}", self.0)
    }

    /// Parse a backend object name produced by [`TLogId::name`]
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        name.strip_prefix(TLOG_NAME_PREFIX)
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(Self)
    }

    /// Check whether an object name denotes a TLog
    #[must_use]
    pub fn is_tlog_name(name: &str) -> bool {
        Self::from_name(name).is_some()
    }
}

impl Default for TLogId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for TLogId {
    type Err = uuid::Error;

    /// Accepts both a bare UUID and a `tlog_<uuid>` object name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix(TLOG_NAME_PREFIX).unwrap_or(s);
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Debug for TLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLogId({})", self.0)
    }
}

impl fmt::Display for TLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token identifying the scrub generation of a snapshot chain
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct ScrubId(Uuid);

impl ScrubId {
    /// Generate a new random scrub ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ScrubId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ScrubId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Debug for ScrubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScrubId({})", self.0)
    }
}

impl fmt::Display for ScrubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a snapshot, unique within a chain
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct SnapshotName(String);

impl SnapshotName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotName({:?})", self.0)
    }
}

impl From<&str> for SnapshotName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Backend namespace holding one volume generation's objects
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct Namespace(String);

impl Namespace {
    /// Create a namespace name.
    ///
    /// Namespaces map onto directory and bucket names, so path separators
    /// and empty names are rejected.
    pub fn new(name: impl Into<String>) -> Result<Self, NamespaceError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NamespaceError::Empty);
        }
        if let Some(c) = name.chars().find(|c| matches!(c, '/' | '\\' | '\0')) {
            return Err(NamespaceError::InvalidChar(c));
        }
        if name == "." || name == ".." {
            return Err(NamespaceError::Reserved(name));
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({:?})", self.0)
    }
}

impl FromStr for Namespace {
    type Err = NamespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Errors that can occur when creating a namespace name
#[derive(Debug, Clone, thiserror::Error)]
pub enum NamespaceError {
    #[error("namespace must not be empty")]
    Empty,
    #[error("namespace contains invalid character: {0:?}")]
    InvalidChar(char),
    #[error("namespace name is reserved: {0}")]
    Reserved(String),
}

/// Depth of a volume in its clone chain; 0 is the volume itself
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct SCOCloneId(u8);

impl SCOCloneId {
    /// The volume itself
    pub const BASE: Self = Self(0);

    #[must_use]
    pub const fn new(depth: u8) -> Self {
        Self(depth)
    }

    #[must_use]
    pub const fn depth(&self) -> u8 {
        self.0
    }

    /// Depth of this level's parent, `None` once the id space is exhausted
    #[must_use]
    pub const fn parent(&self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(d) => Some(Self(d)),
            None => None,
        }
    }
}

/// Origin of a clone: the parent namespace and the snapshot it was cloned from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentConfig {
    pub namespace: Namespace,
    pub snapshot: SnapshotName,
}

impl ParentConfig {
    #[must_use]
    pub const fn new(namespace: Namespace, snapshot: SnapshotName) -> Self {
        Self {
            namespace,
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tlog_name() {
        let id = TLogId::new();
        let name = id.name();
        assert!(name.starts_with("tlog_"));
        assert_eq!(TLogId::from_name(&name), Some(id));
        assert!(TLogId::is_tlog_name(&name));
        assert!(!TLogId::is_tlog_name(&id.to_string()));
        assert!(!TLogId::is_tlog_name("snapshots.xml"));
        assert!(!TLogId::is_tlog_name("tlog_not-a-uuid"));
    }

    #[test]
    fn test_tlog_id_from_str() {
        let id = TLogId::new();
        assert_eq!(id.to_string().parse::<TLogId>().unwrap(), id);
        assert_eq!(id.name().parse::<TLogId>().unwrap(), id);
        assert!("garbage".parse::<TLogId>().is_err());
    }

    #[test]
    fn test_namespace_validation() {
        assert!(Namespace::new("vol-1").is_ok());
        assert!(matches!(Namespace::new(""), Err(NamespaceError::Empty)));
        assert!(matches!(
            Namespace::new("a/b"),
            Err(NamespaceError::InvalidChar('/'))
        ));
        assert!(matches!(
            Namespace::new(".."),
            Err(NamespaceError::Reserved(_))
        ));
    }

    #[test]
    fn test_clone_id_parent() {
        assert_eq!(SCOCloneId::BASE.parent(), Some(SCOCloneId::new(1)));
        assert_eq!(SCOCloneId::new(u8::MAX).parent(), None);
    }

    #[test]
    fn test_scrub_ids_unique() {
        assert_ne!(ScrubId::new(), ScrubId::new());
    }
}
