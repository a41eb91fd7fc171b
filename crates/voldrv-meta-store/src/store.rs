//! Persistent metadata store backed by redb.
//!
//! The store records which TLogs have been replayed into it, in replay
//! order, together with the cork up to which it is in sync with the backend
//! and the scrub generation it was built under.

use crate::tables;
use redb::{Database, ReadableTable, ReadableTableMetadata};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use voldrv_backend::BackendInterface;
use voldrv_common::{CloneTLogs, Error, Result, SCOCloneId, ScrubId, TLogId};
use voldrv_snapshot::NSIDMap;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        Self::meta_data_store(e.to_string())
    }
}

pub type MetaStoreResult<T> = std::result::Result<T, MetaStoreError>;

/// A TLog replayed into the store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayedTLog {
    pub seq: u64,
    pub clone_id: SCOCloneId,
    pub tlog: TLogId,
    /// Namespace the TLog was fetched from
    pub namespace: String,
    pub size: u64,
    pub relocations_applied: bool,
}

/// What [`crate::MetaDataStoreBuilder`] needs from a metadata store
pub trait MetaDataStoreInterface {
    /// Cork up to which the store is in sync, `None` for an empty store
    fn last_cork(&self) -> Result<Option<TLogId>>;

    fn clear_all_keys(&self) -> Result<()>;

    /// Scrub generation the contents were built under
    fn scrub_id(&self) -> Result<Option<ScrubId>>;

    fn set_scrub_id(&self, scrub_id: ScrubId) -> Result<()>;

    /// Replay `clone_tlogs` (oldest level first) and record `end_cork` as
    /// the new sync point. TLogs are fetched through `nsid_map` into
    /// `scratch_dir`.
    fn process_clone_tlogs(
        &self,
        clone_tlogs: &CloneTLogs,
        nsid_map: &NSIDMap,
        scratch_dir: &Path,
        apply_relocations: bool,
        end_cork: Option<TLogId>,
    ) -> Result<()>;
}

/// Metadata store kept in a redb database
pub struct RedbMetaDataStore {
    db: Database,
    path: PathBuf,
}

impl RedbMetaDataStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::CONTROL)?;
            let _t = write_txn.open_table(tables::REPLAYED_TLOGS)?;
        }
        write_txn.commit()?;

        debug!("Opened metadata store {:?}", path);
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All replayed TLogs in replay order
    pub fn replayed_tlogs(&self) -> MetaStoreResult<Vec<ReplayedTLog>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::REPLAYED_TLOGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            result.push(bincode::deserialize(entry.1.value())?);
        }
        Ok(result)
    }

    pub fn num_replayed_tlogs(&self) -> MetaStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::REPLAYED_TLOGS)?;
        Ok(table.len()?)
    }

    fn load_control<T: serde::de::DeserializeOwned>(&self, key: &str) -> MetaStoreResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::CONTROL)?;
        match table.get(key)? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    fn put_bincode<T: Serialize>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn next_seq(&self) -> MetaStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::REPLAYED_TLOGS)?;
        match table.last()? {
            Some(entry) => {
                let last: ReplayedTLog = bincode::deserialize(entry.1.value())?;
                Ok(last.seq + 1)
            }
            None => Ok(0),
        }
    }

    /// Record `replayed` and move the cork in one transaction
    fn commit_replay(&self, replayed: &[ReplayedTLog], end_cork: Option<TLogId>) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::REPLAYED_TLOGS)?;
            for r in replayed {
                let bytes = bincode::serialize(r)?;
                table.insert(tables::replay_key(r.seq).as_str(), bytes.as_slice())?;
            }
        }
        if let Some(cork) = end_cork {
            let bytes = bincode::serialize(&cork)?;
            let mut table = write_txn.open_table(tables::CONTROL)?;
            table.insert(tables::LAST_CORK_KEY, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// Download `tlog` into `scratch_dir` to check it is complete; returns its size
fn fetch_tlog(bi: &dyn BackendInterface, tlog: TLogId, scratch_dir: &Path) -> Result<u64> {
    let name = tlog.name();
    let dst = scratch_dir.join(&name);
    bi.read(&dst, &name, false).inspect_err(|e| {
        error!("Failed to fetch {} from namespace {}: {}", name, bi.namespace(), e);
    })?;
    let size = fs::metadata(&dst)?.len();
    fs::remove_file(&dst)?;
    Ok(size)
}

impl MetaDataStoreInterface for RedbMetaDataStore {
    fn last_cork(&self) -> Result<Option<TLogId>> {
        Ok(self.load_control(tables::LAST_CORK_KEY)?)
    }

    fn clear_all_keys(&self) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(MetaStoreError::from)?;
        (|| -> MetaStoreResult<()> {
            write_txn.delete_table(tables::CONTROL)?;
            write_txn.delete_table(tables::REPLAYED_TLOGS)?;
            let _t = write_txn.open_table(tables::CONTROL)?;
            let _t = write_txn.open_table(tables::REPLAYED_TLOGS)?;
            Ok(())
        })()?;
        write_txn.commit().map_err(MetaStoreError::from)?;
        info!("Cleared metadata store {:?}", self.path);
        Ok(())
    }

    fn scrub_id(&self) -> Result<Option<ScrubId>> {
        Ok(self.load_control(tables::SCRUB_ID_KEY)?)
    }

    fn set_scrub_id(&self, scrub_id: ScrubId) -> Result<()> {
        self.put_bincode(tables::CONTROL, tables::SCRUB_ID_KEY, &scrub_id)?;
        Ok(())
    }

    fn process_clone_tlogs(
        &self,
        clone_tlogs: &CloneTLogs,
        nsid_map: &NSIDMap,
        scratch_dir: &Path,
        apply_relocations: bool,
        end_cork: Option<TLogId>,
    ) -> Result<()> {
        let mut seq = self.next_seq()?;
        let mut replayed = Vec::new();
        for (clone_id, tlogs) in clone_tlogs {
            let bi = nsid_map.get(*clone_id).ok_or_else(|| {
                Error::meta_data_store(format!("no backend for clone level {clone_id}"))
            })?;
            for tlog in tlogs {
                let size = fetch_tlog(bi.as_ref(), *tlog, scratch_dir)?;
                replayed.push(ReplayedTLog {
                    seq,
                    clone_id: *clone_id,
                    tlog: *tlog,
                    namespace: bi.namespace().to_string(),
                    size,
                    relocations_applied: apply_relocations && *clone_id == SCOCloneId::BASE,
                });
                seq += 1;
            }
            debug!("Replayed {} TLogs of clone level {}", tlogs.len(), clone_id);
        }
        self.commit_replay(&replayed, end_cork)?;
        info!(
            "Replayed {} TLogs into {:?}, cork now {:?}",
            replayed.len(),
            self.path,
            end_cork
        );
        Ok(())
    }
}
