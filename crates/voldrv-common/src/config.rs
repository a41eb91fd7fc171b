//! Configuration types for voldrv
//!
//! Loaded from TOML by the binaries; every section has usable defaults.

use crate::types::SNAPSHOTS_FILENAME;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend (object store) configuration
    pub backend: BackendConfig,
    /// Local metadata store configuration
    pub metadata: MetaDataConfig,
    /// Snapshot chain persistence configuration
    pub snapshots: SnapshotsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml(s: &str) -> crate::Result<Self> {
        toml::from_str(s).map_err(|e| crate::Error::Configuration(e.to_string()))
    }
}

/// Backend configuration for the directory-backed object store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Root directory; each namespace is a subdirectory
    pub root: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/voldrv/backend"),
        }
    }
}

/// Local metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaDataConfig {
    /// Path of the redb database file
    pub store_path: PathBuf,
    /// Scratch directory used while replaying TLogs
    pub scratch_dir: PathBuf,
}

impl Default for MetaDataConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("/var/lib/voldrv/mdstore.redb"),
            scratch_dir: PathBuf::from("/var/lib/voldrv/scratch"),
        }
    }
}

/// Snapshot chain persistence configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotsConfig {
    /// File name of the persisted chain
    pub file_name: String,
    /// Where unreadable snapshot files are preserved (disabled if unset)
    pub forensic_dir: Option<PathBuf>,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            file_name: SNAPSHOTS_FILENAME.to_string(),
            forensic_dir: None,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
