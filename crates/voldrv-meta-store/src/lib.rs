//! voldrv Metadata Store - replayed TLog bookkeeping
//!
//! This crate keeps a volume's metadata store in step with the TLogs its
//! backend holds. [`MetaDataStoreBuilder`] computes what needs replaying
//! using the cork protocol; [`RedbMetaDataStore`] records the replay in redb.

pub mod builder;
pub mod store;
pub mod tables;

// Re-exports
pub use builder::{BuildResult, CheckScrubId, DryRun, MetaDataStoreBuilder};
pub use store::{MetaDataStoreInterface, MetaStoreError, MetaStoreResult, RedbMetaDataStore, ReplayedTLog};
