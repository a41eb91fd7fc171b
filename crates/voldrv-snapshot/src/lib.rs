//! voldrv Snapshot - snapshot/TLog metadata of a volume
//!
//! A volume's writes go to an append-only sequence of TLogs. Snapshots seal
//! runs of TLogs under a name; the [`SnapshotPersistor`] tracks them together
//! with which TLogs are already durable in the backend, and persists all of
//! it as `snapshots.xml`.
//!
//! Clones continue the history of a parent snapshot in another namespace;
//! [`SnapshotPersistor::vold`] walks such chains.

pub mod chain;
mod format;
pub mod persistor;
pub mod snapshot;
pub mod store;
pub mod tlog;

pub use chain::{
    BackendRestartAccumulator, BackupAccumulator, CloneChainVisitor, CloneFromParentAccumulator,
    CloneLevel, Direction, NSIDMap, NSIDMapBuilder, effective_last_cork,
};
pub use format::{SNAPSHOT_PERSISTOR_VERSION, SNAPSHOT_VERSION, SNAPSHOTS_VERSION};
pub use persistor::{SaveMode, SnapshotPersistor};
pub use snapshot::{Snapshot, SnapshotWork, Snapshots};
pub use store::SnapshotStore;
pub use tlog::{TLog, TLogs};
