//! Owner of a volume's snapshot persistor.
//!
//! A [`SnapshotPersistor`] has no locking of its own. `SnapshotStore` keeps
//! one behind a mutex together with its local `snapshots.xml` and backend
//! namespace, and persists every mutation before the lock is released.

use crate::persistor::{SaveMode, SnapshotPersistor};
use crate::snapshot::SnapshotWork;
use crate::tlog::TLog;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;
use voldrv_backend::{BackendInterfacePtr, OverwriteObject};
use voldrv_common::{
    ParentConfig, Result, ScrubId, SnapshotMetaData, SnapshotName, SnapshotNum, TLogId,
};

pub struct SnapshotStore {
    path: PathBuf,
    backend: BackendInterfacePtr,
    persistor: Mutex<SnapshotPersistor>,
}

impl SnapshotStore {
    /// Start a new volume generation and write its first image
    pub fn create(
        path: impl Into<PathBuf>,
        backend: BackendInterfacePtr,
        parent: Option<ParentConfig>,
    ) -> Result<Self> {
        let path = path.into();
        let sp = SnapshotPersistor::new(parent);
        sp.save_to_file(&path, SaveMode::SyncAndRename)?;
        info!("Created snapshots file {:?} for namespace {}", path, backend.namespace());
        Ok(Self::with_persistor(path, backend, sp))
    }

    /// Load an existing local image
    pub fn open(path: impl Into<PathBuf>, backend: BackendInterfacePtr) -> Result<Self> {
        let path = path.into();
        let sp = SnapshotPersistor::from_file(&path)?;
        Ok(Self::with_persistor(path, backend, sp))
    }

    /// Like [`SnapshotStore::open`]; a corrupt image is kept in
    /// `forensic_dir` for inspection
    pub fn open_preserving(
        path: impl Into<PathBuf>,
        backend: BackendInterfacePtr,
        forensic_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.into();
        let sp = SnapshotPersistor::from_file_preserving(&path, forensic_dir)?;
        Ok(Self::with_persistor(path, backend, sp))
    }

    /// Rebuild the local image from the backend copy, trimmed to what the
    /// backend actually holds
    pub fn restore_from_backend(path: impl Into<PathBuf>, backend: BackendInterfacePtr) -> Result<Self> {
        let path = path.into();
        let mut sp = SnapshotPersistor::from_backend(backend.as_ref())?;
        sp.trim_to_backend();
        sp.save_to_file(&path, SaveMode::SyncAndRename)?;
        info!(
            "Restored snapshots of namespace {} to {:?}",
            backend.namespace(),
            path
        );
        Ok(Self::with_persistor(path, backend, sp))
    }

    fn with_persistor(path: PathBuf, backend: BackendInterfacePtr, sp: SnapshotPersistor) -> Self {
        Self {
            path,
            backend,
            persistor: Mutex::new(sp),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn backend(&self) -> &BackendInterfacePtr {
        &self.backend
    }

    /// Run a query against the current state
    pub fn read<R>(&self, f: impl FnOnce(&SnapshotPersistor) -> R) -> R {
        f(&self.persistor.lock())
    }

    /// Copy of the current state
    #[must_use]
    pub fn persistor(&self) -> SnapshotPersistor {
        self.persistor.lock().clone()
    }

    /// Apply a mutation and persist the result.
    ///
    /// The mutation runs on a copy; the in-memory state only changes once
    /// the new image is on disk.
    pub fn update<R>(&self, f: impl FnOnce(&mut SnapshotPersistor) -> Result<R>) -> Result<R> {
        let mut guard = self.persistor.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if next != *guard {
            next.save_to_file(&self.path, SaveMode::SyncAndRename)?;
            *guard = next;
        }
        Ok(out)
    }

    pub fn new_tlog(&self) -> Result<TLogId> {
        self.update(|sp| Ok(sp.new_tlog()))
    }

    pub fn snapshot(
        &self,
        name: &SnapshotName,
        metadata: SnapshotMetaData,
        uuid: Uuid,
        scrubbed: bool,
    ) -> Result<SnapshotNum> {
        self.update(|sp| sp.snapshot(name, metadata, uuid, scrubbed))
    }

    pub fn delete_snapshot(&self, num: SnapshotNum) -> Result<()> {
        self.update(|sp| sp.delete_snapshot(num))
    }

    pub fn set_tlog_written_to_backend(&self, id: TLogId) -> Result<()> {
        self.update(|sp| sp.set_tlog_written_to_backend(id))
    }

    pub fn add_current_backend_size(&self, size: u64) -> Result<()> {
        self.update(|sp| {
            sp.add_current_backend_size(size);
            Ok(())
        })
    }

    pub fn set_snapshot_scrubbed(&self, num: SnapshotNum, scrubbed: bool) -> Result<()> {
        self.update(|sp| sp.set_snapshot_scrubbed(num, scrubbed))
    }

    pub fn scrubbing_work(
        &self,
        start: Option<&SnapshotName>,
        end: Option<&SnapshotName>,
    ) -> Result<SnapshotWork> {
        self.read(|sp| sp.get_snapshot_scrubbing_work(start, end))
    }

    /// Apply a scrub result; an outdated result leaves the store untouched
    pub fn apply_scrub_result(
        &self,
        old_ids: &[TLogId],
        new_tlogs: Vec<TLog>,
        num: SnapshotNum,
    ) -> Result<ScrubId> {
        self.update(|sp| sp.replace(old_ids, new_tlogs, num))
            .inspect_err(|e| warn!("Scrub result for snapshot {} not applied: {}", num, e))
    }

    pub fn trim_to_backend(&self) -> Result<()> {
        self.update(|sp| {
            sp.trim_to_backend();
            Ok(())
        })
    }

    /// Publish the current image as `snapshots.xml` in the backend
    pub fn write_to_backend(&self) -> Result<()> {
        let guard = self.persistor.lock();
        guard.write_to_backend(self.backend.as_ref(), OverwriteObject::Yes)
    }
}
