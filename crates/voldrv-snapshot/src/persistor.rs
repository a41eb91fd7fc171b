//! The snapshot persistor: open TLogs, the snapshot chain, the clone parent
//! and the scrub generation of one volume generation.
//!
//! A persistor performs no locking of its own. All mutating calls on one
//! instance must be serialized by the caller; [`crate::SnapshotStore`] is
//! the in-tree owner that does so.

use crate::format;
use crate::snapshot::{Snapshot, SnapshotWork, Snapshots};
use crate::tlog::{TLog, TLogs, WrittenPrefixVerifier};
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use voldrv_backend::{BackendInterface, OverwriteObject};
use voldrv_common::{
    Error, MAX_SNAPSHOT_METADATA_SIZE, OrderedTLogIds, ParentConfig, Result, SNAPSHOTS_FILENAME,
    ScrubId, SnapshotMetaData, SnapshotName, SnapshotNum, TLogId,
};

/// How [`SnapshotPersistor::save_to_file`] writes the image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveMode {
    /// Write a temporary file next to the target, fsync it and rename it
    /// into place. Readers never observe a partial image.
    SyncAndRename,
    /// Overwrite the target directly. Not crash safe; scratch use only.
    InPlace,
}

/// Snapshot/TLog metadata of one volume generation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotPersistor {
    current: TLogs,
    snapshots: Snapshots,
    parent: Option<ParentConfig>,
    scrub_id: ScrubId,
}

impl SnapshotPersistor {
    /// A fresh persistor with a single open TLog
    #[must_use]
    pub fn new(parent: Option<ParentConfig>) -> Self {
        let mut sp = Self::from_parts(TLogs::new(), Snapshots::new(), parent, ScrubId::new());
        sp.new_tlog();
        sp
    }

    pub(crate) const fn from_parts(
        current: TLogs,
        snapshots: Snapshots,
        parent: Option<ParentConfig>,
        scrub_id: ScrubId,
    ) -> Self {
        Self {
            current,
            snapshots,
            parent,
            scrub_id,
        }
    }

    #[must_use]
    pub const fn parent(&self) -> Option<&ParentConfig> {
        self.parent.as_ref()
    }

    #[must_use]
    pub const fn current(&self) -> &TLogs {
        &self.current
    }

    #[must_use]
    pub const fn snapshots(&self) -> &Snapshots {
        &self.snapshots
    }

    #[must_use]
    pub const fn scrub_id(&self) -> ScrubId {
        self.scrub_id
    }

    /// Start a new scrub generation
    pub fn new_scrub_id(&mut self) -> ScrubId {
        self.scrub_id = ScrubId::new();
        self.scrub_id
    }

    /// Roll over: append a fresh open TLog to `current`
    pub fn new_tlog(&mut self) -> TLogId {
        let tlog = TLog::new();
        let id = tlog.id();
        self.current.push(tlog);
        info!("Starting new TLog {}", id);
        id
    }

    /// Id of the open TLog
    ///
    /// # Panics
    ///
    /// Panics if `current` is empty, which no public operation leaves behind.
    #[must_use]
    pub fn current_tlog(&self) -> TLogId {
        match self.current.last() {
            Some(tlog) => tlog.id(),
            None => panic!("snapshot persistor without an open TLog"),
        }
    }

    /// Seal `current` into a new snapshot and open a fresh TLog.
    ///
    /// Fails without any change if the name is taken or the metadata exceeds
    /// [`MAX_SNAPSHOT_METADATA_SIZE`].
    pub fn snapshot(
        &mut self,
        name: &SnapshotName,
        metadata: SnapshotMetaData,
        uuid: Uuid,
        scrubbed: bool,
    ) -> Result<SnapshotNum> {
        if self.snapshot_exists(name) {
            error!(
                "Couldn't create snapshot {} - a snapshot of that name already exists",
                name
            );
            return Err(Error::SnapshotNameAlreadyExists(name.clone()));
        }
        if metadata.len() > MAX_SNAPSHOT_METADATA_SIZE {
            error!(
                "Refusing to create snapshot {} as the attached metadata exceeds the limit of {} bytes",
                name, MAX_SNAPSHOT_METADATA_SIZE
            );
            return Err(Error::MetadataTooLarge {
                size: metadata.len(),
                max: MAX_SNAPSHOT_METADATA_SIZE,
            });
        }

        let num = self.snapshots.next_snapshot_num();
        let tlogs = std::mem::take(&mut self.current);
        self.snapshots.push(Snapshot::new(
            num,
            name.clone(),
            tlogs,
            metadata,
            uuid,
            scrubbed,
        ));
        info!("Created snapshot {} (num {})", name, num);
        self.new_tlog();
        Ok(num)
    }

    pub fn delete_snapshot(&mut self, num: SnapshotNum) -> Result<()> {
        self.snapshots.delete_snapshot(num, &mut self.current)?;
        info!("Deleted snapshot {}", num);
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if there are no snapshots.
    pub fn delete_all_but_last_snapshot(&mut self) {
        self.snapshots.delete_all_but_last_snapshot();
        info!("Deleted all but the last snapshot");
    }

    /// Roll back to snapshot `num`: later snapshots and all of `current`
    /// are dropped and a fresh TLog is opened
    pub fn delete_tlogs_and_snapshots_after_snapshot(&mut self, num: SnapshotNum) -> Result<()> {
        self.snapshots.delete_tlogs_and_snapshots_after_snapshot(num)?;
        self.current.clear();
        self.new_tlog();
        info!("Rolled back to snapshot {}", num);
        Ok(())
    }

    /// Mark `id` durable.
    ///
    /// Unknown ids are logged and ignored; they show up after a snapshot
    /// rollback. Fails if an older TLog is not durable yet.
    pub fn set_tlog_written_to_backend(&mut self, id: TLogId) -> Result<()> {
        if !self.tlog_referenced(id) {
            warn!(
                "Couldn't find TLog {}, probably after a snapshot restore. These messages should not persist!",
                id
            );
            return Ok(());
        }
        // snapshots before current: the ordering check depends on it
        if !self.snapshots.set_tlog_written_to_backend(id)? {
            self.current.set_tlog_written_to_backend(id)?;
        }
        debug!("TLog {} written to backend", id);
        Ok(())
    }

    #[must_use]
    pub fn is_tlog_written_to_backend(&self, id: TLogId) -> bool {
        self.current
            .is_tlog_written_to_backend(id)
            .or_else(|| self.snapshots.is_tlog_written_to_backend(id))
            .unwrap_or(false)
    }

    fn all_tlogs(&self) -> impl Iterator<Item = &TLog> {
        self.snapshots
            .iter()
            .flat_map(|s| s.tlogs().iter())
            .chain(self.current.iter())
    }

    /// The durable prefix of the whole chain
    #[must_use]
    pub fn get_tlogs_written_to_backend(&self) -> OrderedTLogIds {
        self.all_tlogs()
            .take_while(|t| t.written_to_backend())
            .map(TLog::id)
            .collect()
    }

    /// Everything after the durable prefix of the whole chain
    #[must_use]
    pub fn get_tlogs_not_written_to_backend(&self) -> OrderedTLogIds {
        self.all_tlogs()
            .skip_while(|t| t.written_to_backend())
            .map(TLog::id)
            .collect()
    }

    #[must_use]
    pub fn get_current_tlogs_written_to_backend(&self) -> OrderedTLogIds {
        self.current.tlogs_on_backend().ids()
    }

    #[must_use]
    pub fn get_current_tlogs_not_written_to_backend(&self) -> OrderedTLogIds {
        self.current
            .iter()
            .skip_while(|t| t.written_to_backend())
            .map(TLog::id)
            .collect()
    }

    pub fn get_tlogs_in_snapshot(&self, num: SnapshotNum) -> Result<OrderedTLogIds> {
        self.snapshots.get_tlogs_in_snapshot(num)
    }

    #[must_use]
    pub fn get_current_tlogs(&self) -> OrderedTLogIds {
        self.current.ids()
    }

    pub fn get_tlogs_till_snapshot(&self, num: SnapshotNum) -> Result<OrderedTLogIds> {
        self.snapshots.get_tlogs_till_snapshot(num)
    }

    pub fn get_tlogs_till_snapshot_name(&self, name: &SnapshotName) -> Result<OrderedTLogIds> {
        self.get_tlogs_till_snapshot(self.get_snapshot_num(name)?)
    }

    /// TLogs of the snapshots after `num` followed by `current`
    pub fn get_tlogs_after_snapshot(&self, num: SnapshotNum) -> Result<OrderedTLogIds> {
        let mut out = self.snapshots.get_tlogs_after_snapshot(num)?;
        out.extend(self.current.ids());
        Ok(out)
    }

    pub fn get_tlogs_between_snapshots(
        &self,
        start: SnapshotNum,
        end: SnapshotNum,
        including_end: bool,
    ) -> Result<OrderedTLogIds> {
        self.snapshots
            .get_tlogs_between_snapshots(start, end, including_end)
    }

    /// Every TLog of every snapshot, oldest first, then `current` if asked
    #[must_use]
    pub fn get_all_tlogs(&self, with_current: bool) -> OrderedTLogIds {
        let mut out: OrderedTLogIds = self
            .snapshots
            .iter()
            .flat_map(|s| s.tlogs().iter().map(TLog::id))
            .collect();
        if with_current {
            out.extend(self.current.ids());
        }
        out
    }

    #[must_use]
    pub fn snapshot_exists(&self, name: &SnapshotName) -> bool {
        self.snapshots.find_by_name(name).is_some()
    }

    #[must_use]
    pub fn snapshot_num_exists(&self, num: SnapshotNum) -> bool {
        self.snapshots.find_by_num(num).is_some()
    }

    #[must_use]
    pub fn snapshots_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get_snapshot(&self, name: &SnapshotName) -> Result<&Snapshot> {
        self.snapshots.get_by_name(name)
    }

    pub fn get_snapshot_num(&self, name: &SnapshotName) -> Result<SnapshotNum> {
        Ok(self.get_snapshot(name)?.num())
    }

    pub fn get_snapshot_name(&self, num: SnapshotNum) -> Result<SnapshotName> {
        Ok(self.snapshots.get_by_num(num)?.name().clone())
    }

    pub fn get_uuid(&self, num: SnapshotNum) -> Result<Uuid> {
        Ok(self.snapshots.get_by_num(num)?.uuid())
    }

    #[must_use]
    pub fn has_snapshot_with_uuid(&self, uuid: Uuid) -> bool {
        self.snapshots.find_by_uuid(uuid).is_some()
    }

    #[must_use]
    pub fn check_snapshot_uuid(&self, name: &SnapshotName, uuid: Uuid) -> bool {
        self.snapshots.check_snapshot_uuid(name, uuid)
    }

    pub fn get_snapshots_till(&self, num: SnapshotNum, including: bool) -> Result<Vec<SnapshotNum>> {
        self.snapshots.get_snapshots_till(num, including)
    }

    pub fn get_snapshots_after(&self, num: SnapshotNum) -> Result<Vec<SnapshotNum>> {
        self.snapshots.get_snapshots_after(num)
    }

    #[must_use]
    pub fn get_all_snapshots(&self) -> Vec<SnapshotNum> {
        self.snapshots.get_all_snapshots()
    }

    pub fn is_snapshot_in_backend(&self, num: SnapshotNum) -> Result<bool> {
        Ok(self.snapshots.get_by_num(num)?.in_backend())
    }

    pub fn get_snapshot_cork(&self, name: &SnapshotName) -> Result<Option<TLogId>> {
        Ok(self.get_snapshot(name)?.cork())
    }

    #[must_use]
    pub fn tlog_referenced(&self, id: TLogId) -> bool {
        self.snapshots.tlog_referenced(id) || self.current.tlog_referenced(id)
    }

    /// Scrubbed flag of snapshot `num`; with `nothrow` a missing snapshot
    /// counts as scrubbed
    pub fn get_snapshot_scrubbed(&self, num: SnapshotNum, nothrow: bool) -> Result<bool> {
        match self.snapshots.find_by_num(num) {
            Some(s) => Ok(s.scrubbed()),
            None if nothrow => Ok(true),
            None => {
                error!("Snapshot with num {} does not exist", num);
                Err(Error::snapshot_not_found(format!("num {num}")))
            }
        }
    }

    pub fn set_snapshot_scrubbed(&mut self, num: SnapshotNum, scrubbed: bool) -> Result<()> {
        self.snapshots.get_by_num_mut(num)?.scrubbed = scrubbed;
        Ok(())
    }

    pub fn get_snapshot_scrubbing_work(
        &self,
        start: Option<&SnapshotName>,
        end: Option<&SnapshotName>,
    ) -> Result<SnapshotWork> {
        self.snapshots.snapshot_scrubbing_work(start, end)
    }

    /// Apply a scrub result to snapshot `num` and start a new scrub
    /// generation
    ///
    /// # Panics
    ///
    /// Panics if any of `new_tlogs` is not durable.
    pub fn replace(
        &mut self,
        old_ids: &[TLogId],
        new_tlogs: Vec<TLog>,
        num: SnapshotNum,
    ) -> Result<ScrubId> {
        self.snapshots.replace(old_ids, new_tlogs, num)?;
        let scrub_id = self.new_scrub_id();
        info!("Applied scrub result to snapshot {}, scrub id {}", num, scrub_id);
        Ok(scrub_id)
    }

    /// Account uploaded bytes to the open TLog
    ///
    /// # Panics
    ///
    /// Panics if `current` is empty.
    pub fn add_current_backend_size(&mut self, size: u64) {
        match self.current.last_mut() {
            Some(tlog) => tlog.add_to_backend_size(size),
            None => panic!("snapshot persistor without an open TLog"),
        }
    }

    #[must_use]
    pub fn get_current_backend_size(&self) -> u64 {
        self.current.backend_size()
    }

    pub fn get_snapshot_backend_size(&self, name: &SnapshotName) -> Result<u64> {
        Ok(self.get_snapshot(name)?.backend_size())
    }

    #[must_use]
    pub fn get_total_backend_size(&self) -> u64 {
        self.snapshots.total_backend_size() + self.get_current_backend_size()
    }

    /// Backend size of the snapshots in `(start, end]`
    pub fn get_backend_size(&self, end: &SnapshotName, start: Option<&SnapshotName>) -> Result<u64> {
        self.snapshots.backend_size(end, start)
    }

    /// Reduce the chain to what the backend is known to hold.
    ///
    /// The oldest snapshot that is not fully durable and everything after it
    /// are dropped; its durable prefix becomes `current`. Without such a
    /// snapshot `current` is cut to its durable prefix. A fresh TLog is
    /// opened either way. Backend size counters are not adjusted.
    pub fn trim_to_backend(&mut self) {
        match self.snapshots.iter().position(|s| !s.in_backend()) {
            Some(pos) => {
                let dropped = self.snapshots.split_off(pos);
                self.current = dropped[0].tlogs().tlogs_on_backend();
                for s in &dropped {
                    info!("Trimming snapshot {} not on backend", s.name());
                }
            }
            None => {
                self.current = self.current.tlogs_on_backend();
            }
        }
        self.new_tlog();
    }

    /// Cut the chain right after `id`, optionally resetting its backend
    /// size. If `id` belongs to a snapshot, that snapshot becomes `current`
    /// and all later snapshots are dropped. Returns whether `id` was found.
    pub fn snip(&mut self, id: TLogId, backend_size: Option<u64>) -> bool {
        if self.snapshots.snip(id, backend_size) {
            if let Some(last) = self.snapshots.pop() {
                info!("Snapshot {} dissolved into current", last.name());
                self.current = last.tlogs;
            }
            true
        } else {
            self.current.snip(id, backend_size)
        }
    }

    /// Newest durable TLog: scans `current`, then the snapshots newest
    /// first (yielding a durable snapshot's cork)
    #[must_use]
    pub fn last_cork(&self) -> Option<TLogId> {
        if let Some(tlog) = self.current.iter().rev().find(|t| t.written_to_backend()) {
            return Some(tlog.id());
        }
        self.snapshots
            .iter()
            .rev()
            .find(|s| s.in_backend())
            .and_then(Snapshot::cork)
    }

    /// Durable TLogs strictly after `cork`, oldest first.
    ///
    /// `implicit_start_cork` is where the search may end for a clone: a cork
    /// that is not part of this chain is accepted if it equals it.
    ///
    /// # Panics
    ///
    /// Panics if `implicit_start_cork` is given for a non-clone or missing
    /// for a clone.
    pub fn get_tlogs_on_backend_since_last_cork(
        &self,
        cork: Option<TLogId>,
        implicit_start_cork: Option<TLogId>,
    ) -> Result<OrderedTLogIds> {
        assert_eq!(
            self.parent.is_some(),
            implicit_start_cork.is_some(),
            "implicit start cork must be given exactly for clones"
        );

        let mut reversed = OrderedTLogIds::new();
        let mut found = self
            .current
            .reversed_tlogs_on_backend_since(cork, &mut reversed)?;
        for snapshot in self.snapshots.iter().rev() {
            if found {
                break;
            }
            found = snapshot.reversed_tlogs_on_backend_since(cork, &mut reversed)?;
        }

        if found || cork == implicit_start_cork {
            reversed.reverse();
            Ok(reversed)
        } else {
            error!("Could not find cork {:?} in the snapshot chain", cork);
            Err(Error::CorkNotFound(
                cork.map_or_else(|| "none".to_string(), |c| c.to_string()),
            ))
        }
    }

    /// Check the written-to-backend prefix invariant
    pub fn verify_sanity(&self) -> Result<()> {
        let mut verifier = WrittenPrefixVerifier::default();
        for snapshot in self.snapshots.iter() {
            verifier.check(snapshot.tlogs())?;
        }
        verifier.check(&self.current)
    }

    // ---- Persistence ----

    pub fn to_xml_string(&self) -> Result<String> {
        format::to_xml(self)
    }

    pub fn from_xml_str(xml: &str) -> Result<Self> {
        format::from_xml(xml)
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        format::from_reader(reader).inspect_err(|e| {
            error!("Could not read snapshots stream: {}", e);
        })
    }

    /// Load from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_file(path.as_ref(), None)
    }

    /// Load from a file; an image that fails to parse or verify is copied
    /// into `forensic_dir` before the error is returned
    pub fn from_file_preserving(path: impl AsRef<Path>, forensic_dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_file(path.as_ref(), Some(forensic_dir.as_ref()))
    }

    fn load_file(path: &Path, forensic_dir: Option<&Path>) -> Result<Self> {
        let xml = fs::read_to_string(path).inspect_err(|e| {
            error!("Could not read snapshots file {:?}: {}", path, e);
        })?;
        match format::from_xml(&xml) {
            Ok(sp) => {
                debug!("Loaded snapshots from {:?}", path);
                Ok(sp)
            }
            Err(e) => {
                error!("Caught error while deserializing {:?}: {}", path, e);
                if let Some(dir) = forensic_dir {
                    match preserve_faulty(path, dir) {
                        Ok(copy) => error!("Preserved faulty snapshots file as {:?}", copy),
                        Err(copy_err) => {
                            error!("Failed to preserve faulty snapshots file {:?}: {}", path, copy_err);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Persist the XML image to `path`
    pub fn save_to_file(&self, path: impl AsRef<Path>, mode: SaveMode) -> Result<()> {
        let path = path.as_ref();
        let xml = self.to_xml_string()?;
        match mode {
            SaveMode::SyncAndRename => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let mut temp = NamedTempFile::new_in(dir)?;
                temp.write_all(xml.as_bytes())?;
                temp.as_file().sync_all()?;
                temp.persist(path).map_err(|e| {
                    error!("Failed to persist snapshots to {:?}: {}", path, e.error);
                    Error::Io(e.error)
                })?;
            }
            SaveMode::InPlace => fs::write(path, xml.as_bytes())?,
        }
        debug!("Saved snapshots to {:?} ({:?})", path, mode);
        Ok(())
    }

    /// Load the image stored in `bi`'s namespace
    pub fn from_backend(bi: &dyn BackendInterface) -> Result<Self> {
        debug!("Filling snapshots from backend namespace {}", bi.namespace());
        let bytes = bi.get_object(SNAPSHOTS_FILENAME, true)?;
        Self::from_reader(bytes.as_slice())
    }

    /// Store the image in `bi`'s namespace
    pub fn write_to_backend(&self, bi: &dyn BackendInterface, overwrite: OverwriteObject) -> Result<()> {
        let xml = self.to_xml_string()?;
        bi.put_object(SNAPSHOTS_FILENAME, xml.as_bytes(), overwrite)?;
        info!("Wrote snapshots to backend namespace {}", bi.namespace());
        Ok(())
    }

    /// The parent's persistor, loaded from the parent namespace
    pub fn parent_snapshot_persistor(&self, bi: &dyn BackendInterface) -> Result<Option<Self>> {
        self.parent
            .as_ref()
            .map(|p| Self::from_backend(bi.clone_with_new_namespace(&p.namespace).as_ref()))
            .transpose()
    }
}

fn preserve_faulty(path: &Path, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S%.3f");
    let target = dir.join(format!("faulty_snapshots_{stamp}.xml"));
    fs::copy(path, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use voldrv_common::Namespace;

    fn name(s: &str) -> SnapshotName {
        SnapshotName::new(s)
    }

    fn write_all(sp: &mut SnapshotPersistor) {
        for id in sp.get_all_tlogs(true) {
            sp.set_tlog_written_to_backend(id).unwrap();
        }
    }

    #[test]
    fn test_new_has_open_tlog() {
        let sp = SnapshotPersistor::new(None);
        assert_eq!(sp.get_current_tlogs().len(), 1);
        assert!(sp.snapshots_empty());
        assert_eq!(sp.last_cork(), None);
        assert!(!sp.is_tlog_written_to_backend(sp.current_tlog()));
    }

    #[test]
    fn test_snapshot_seals_current() {
        let mut sp = SnapshotPersistor::new(None);
        sp.new_tlog();
        let sealed = sp.get_current_tlogs();

        let num = sp.snapshot(&name("s"), Vec::new(), Uuid::new_v4(), false).unwrap();
        assert_eq!(num, 0);
        assert_eq!(sp.get_tlogs_in_snapshot(0).unwrap(), sealed);
        assert_eq!(sp.get_current_tlogs().len(), 1);
        assert_eq!(sp.get_snapshot_cork(&name("s")).unwrap(), sealed.last().copied());
    }

    #[test]
    fn test_duplicate_snapshot_name() {
        let mut sp = SnapshotPersistor::new(None);
        sp.snapshot(&name("s"), Vec::new(), Uuid::new_v4(), false).unwrap();
        let before = sp.clone();

        let result = sp.snapshot(&name("s"), Vec::new(), Uuid::new_v4(), false);
        assert!(matches!(result, Err(Error::SnapshotNameAlreadyExists(_))));
        assert_eq!(sp, before);
    }

    #[test]
    fn test_metadata_limit() {
        let mut sp = SnapshotPersistor::new(None);
        let before = sp.clone();
        let result = sp.snapshot(&name("big"), vec![0; 4097], Uuid::new_v4(), false);
        assert!(matches!(
            result,
            Err(Error::MetadataTooLarge {
                size: 4097,
                max: 4096
            })
        ));
        assert_eq!(sp, before);

        sp.snapshot(&name("fits"), vec![7; 4096], Uuid::new_v4(), false)
            .unwrap();
        assert_eq!(sp.get_snapshot(&name("fits")).unwrap().metadata(), &[7; 4096][..]);
    }

    #[test]
    fn test_set_written_ordering() {
        let mut sp = SnapshotPersistor::new(None);
        sp.new_tlog();
        let ids = sp.get_current_tlogs();

        let err = sp.set_tlog_written_to_backend(ids[1]).unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { .. }));
        assert!(err.is_corruption());

        sp.set_tlog_written_to_backend(ids[0]).unwrap();
        sp.set_tlog_written_to_backend(ids[1]).unwrap();
        assert!(sp.is_tlog_written_to_backend(ids[1]));

        // unknown TLogs are ignored
        sp.set_tlog_written_to_backend(TLogId::new()).unwrap();
    }

    #[test]
    fn test_set_written_across_snapshots() {
        let mut sp = SnapshotPersistor::new(None);
        sp.snapshot(&name("s"), Vec::new(), Uuid::new_v4(), false).unwrap();
        let in_snap = sp.get_tlogs_in_snapshot(0).unwrap()[0];
        let open = sp.current_tlog();

        assert!(matches!(
            sp.set_tlog_written_to_backend(open),
            Err(Error::OrderingViolation { predecessor, .. }) if predecessor == in_snap
        ));
        sp.set_tlog_written_to_backend(in_snap).unwrap();
        sp.set_tlog_written_to_backend(open).unwrap();
        assert!(sp.is_snapshot_in_backend(0).unwrap());
    }

    #[test]
    fn test_written_partitions() {
        let mut sp = SnapshotPersistor::new(None);
        sp.new_tlog();
        sp.snapshot(&name("s"), Vec::new(), Uuid::new_v4(), false).unwrap();
        sp.new_tlog();
        let all = sp.get_all_tlogs(true);
        for id in &all[..3] {
            sp.set_tlog_written_to_backend(*id).unwrap();
        }

        assert_eq!(sp.get_tlogs_written_to_backend(), all[..3].to_vec());
        assert_eq!(sp.get_tlogs_not_written_to_backend(), all[3..].to_vec());
        assert_eq!(sp.get_current_tlogs_written_to_backend(), vec![all[2]]);
        assert_eq!(sp.get_current_tlogs_not_written_to_backend(), vec![all[3]]);
    }

    #[test]
    fn test_last_cork() {
        let mut sp = SnapshotPersistor::new(None);
        sp.new_tlog();
        sp.snapshot(&name("s"), Vec::new(), Uuid::new_v4(), false).unwrap();
        let snap_tlogs = sp.get_tlogs_in_snapshot(0).unwrap();
        assert_eq!(sp.last_cork(), None);

        sp.set_tlog_written_to_backend(snap_tlogs[0]).unwrap();
        // snapshot not fully durable yet
        assert_eq!(sp.last_cork(), None);

        sp.set_tlog_written_to_backend(snap_tlogs[1]).unwrap();
        assert_eq!(sp.last_cork(), Some(snap_tlogs[1]));

        let open = sp.current_tlog();
        sp.set_tlog_written_to_backend(open).unwrap();
        assert_eq!(sp.last_cork(), Some(open));
    }

    #[test]
    fn test_tlogs_since_cork() {
        let mut sp = SnapshotPersistor::new(None);
        sp.new_tlog();
        sp.snapshot(&name("s"), Vec::new(), Uuid::new_v4(), false).unwrap();
        sp.new_tlog();
        let all = sp.get_all_tlogs(true);
        for id in &all[..3] {
            sp.set_tlog_written_to_backend(*id).unwrap();
        }

        assert_eq!(
            sp.get_tlogs_on_backend_since_last_cork(None, None).unwrap(),
            all[..3].to_vec()
        );
        assert_eq!(
            sp.get_tlogs_on_backend_since_last_cork(Some(all[0]), None)
                .unwrap(),
            all[1..3].to_vec()
        );
        assert!(
            sp.get_tlogs_on_backend_since_last_cork(Some(all[2]), None)
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            sp.get_tlogs_on_backend_since_last_cork(Some(all[3]), None),
            Err(Error::CorkNotOnBackend(_))
        ));
        assert!(matches!(
            sp.get_tlogs_on_backend_since_last_cork(Some(TLogId::new()), None),
            Err(Error::CorkNotFound(_))
        ));
    }

    #[test]
    fn test_tlogs_since_snapshot_cork_after_scrub() {
        let mut sp = SnapshotPersistor::new(None);
        sp.new_tlog();
        sp.snapshot(&name("s"), Vec::new(), Uuid::new_v4(), false).unwrap();
        write_all(&mut sp);
        let cork = sp.get_snapshot_cork(&name("s")).unwrap();
        let old = sp.get_tlogs_in_snapshot(0).unwrap();
        let scrubbed = TLog::from_parts(TLogId::new(), true, 1);
        sp.replace(&old, vec![scrubbed], 0).unwrap();

        let open = sp.current_tlog();
        assert_eq!(
            sp.get_tlogs_on_backend_since_last_cork(cork, None).unwrap(),
            vec![open]
        );
    }

    #[test]
    #[should_panic(expected = "implicit start cork")]
    fn test_implicit_cork_requires_parent() {
        let sp = SnapshotPersistor::new(None);
        let _ = sp.get_tlogs_on_backend_since_last_cork(None, Some(TLogId::new()));
    }

    #[test]
    fn test_clone_implicit_start_cork() {
        let parent = ParentConfig::new(Namespace::new("p").unwrap(), name("base"));
        let mut sp = SnapshotPersistor::new(Some(parent));
        let open = sp.current_tlog();
        sp.set_tlog_written_to_backend(open).unwrap();
        let parent_cork = TLogId::new();

        assert_eq!(
            sp.get_tlogs_on_backend_since_last_cork(Some(parent_cork), Some(parent_cork))
                .unwrap(),
            vec![open]
        );
        assert!(matches!(
            sp.get_tlogs_on_backend_since_last_cork(Some(TLogId::new()), Some(parent_cork)),
            Err(Error::CorkNotFound(_))
        ));
    }

    #[test]
    fn test_trim_to_backend_drops_partial_snapshot() {
        let mut sp = SnapshotPersistor::new(None);
        sp.new_tlog();
        sp.snapshot(&name("a"), Vec::new(), Uuid::new_v4(), false).unwrap();
        sp.new_tlog();
        sp.snapshot(&name("b"), Vec::new(), Uuid::new_v4(), false).unwrap();
        sp.snapshot(&name("c"), Vec::new(), Uuid::new_v4(), false).unwrap();
        let a = sp.get_tlogs_in_snapshot(0).unwrap();
        let b = sp.get_tlogs_in_snapshot(1).unwrap();
        for id in a.iter().chain(&b[..1]) {
            sp.set_tlog_written_to_backend(*id).unwrap();
        }

        sp.trim_to_backend();
        assert_eq!(sp.get_all_snapshots(), vec![0]);
        let current = sp.get_current_tlogs();
        assert_eq!(current.len(), 2);
        assert_eq!(current[0], b[0]);
        assert!(!sp.is_tlog_written_to_backend(current[1]));
        sp.verify_sanity().unwrap();
    }

    #[test]
    fn test_trim_to_backend_current_only() {
        let mut sp = SnapshotPersistor::new(None);
        let first = sp.current_tlog();
        sp.new_tlog();
        sp.new_tlog();
        sp.set_tlog_written_to_backend(first).unwrap();

        sp.trim_to_backend();
        let current = sp.get_current_tlogs();
        assert_eq!(current.len(), 2);
        assert_eq!(current[0], first);
    }

    #[test]
    fn test_snip_in_snapshot() {
        let mut sp = SnapshotPersistor::new(None);
        sp.new_tlog();
        sp.new_tlog();
        sp.snapshot(&name("a"), Vec::new(), Uuid::new_v4(), false).unwrap();
        sp.snapshot(&name("b"), Vec::new(), Uuid::new_v4(), false).unwrap();
        let a = sp.get_tlogs_in_snapshot(0).unwrap();

        assert!(sp.snip(a[1], Some(42)));
        assert!(sp.snapshots_empty());
        assert_eq!(sp.get_current_tlogs(), a[..2].to_vec());
        assert_eq!(sp.get_current_backend_size(), 42);

        assert!(!sp.snip(TLogId::new(), None));
        assert!(sp.snip(a[0], None));
        assert_eq!(sp.get_current_tlogs(), vec![a[0]]);
    }

    #[test]
    fn test_rollback() {
        let mut sp = SnapshotPersistor::new(None);
        for i in 0..3 {
            sp.new_tlog();
            sp.snapshot(&name(&format!("s{i}")), Vec::new(), Uuid::new_v4(), false)
                .unwrap();
        }
        sp.new_tlog();

        sp.delete_tlogs_and_snapshots_after_snapshot(0).unwrap();
        assert_eq!(sp.get_all_snapshots(), vec![0]);
        assert_eq!(sp.get_current_tlogs().len(), 1);
        assert!(sp.delete_tlogs_and_snapshots_after_snapshot(5).unwrap_err().is_not_found());
        assert_eq!(sp.snapshot(&name("next"), Vec::new(), Uuid::new_v4(), false).unwrap(), 3);
    }

    #[test]
    fn test_deleted_last_snapshot_number_not_reused() {
        let mut sp = SnapshotPersistor::new(None);
        sp.snapshot(&name("s0"), Vec::new(), Uuid::new_v4(), false).unwrap();
        let n1 = sp.snapshot(&name("s1"), Vec::new(), Uuid::new_v4(), false).unwrap();
        sp.delete_snapshot(n1).unwrap();

        let n2 = sp.snapshot(&name("s2"), Vec::new(), Uuid::new_v4(), false).unwrap();
        assert_ne!(n1, n2);
        assert_eq!(n2, 2);

        // snipping into a snapshot does not release its number either
        let s2_tlog = sp.get_tlogs_in_snapshot(n2).unwrap()[0];
        assert!(sp.snip(s2_tlog, None));
        assert_eq!(sp.get_all_snapshots(), vec![0]);
        assert_eq!(sp.snapshot(&name("s3"), Vec::new(), Uuid::new_v4(), false).unwrap(), 3);
    }

    #[test]
    fn test_scrub_bookkeeping() {
        let mut sp = SnapshotPersistor::new(None);
        sp.snapshot(&name("a"), Vec::new(), Uuid::new_v4(), false).unwrap();
        sp.snapshot(&name("b"), Vec::new(), Uuid::new_v4(), true).unwrap();

        assert!(!sp.get_snapshot_scrubbed(0, false).unwrap());
        assert!(sp.get_snapshot_scrubbed(1, false).unwrap());
        assert!(sp.get_snapshot_scrubbed(9, true).unwrap());
        assert!(sp.get_snapshot_scrubbed(9, false).is_err());

        // nothing durable, nothing to scrub
        assert!(sp.get_snapshot_scrubbing_work(None, None).unwrap().is_empty());
        write_all(&mut sp);
        assert_eq!(sp.get_snapshot_scrubbing_work(None, None).unwrap(), vec![name("a")]);

        sp.set_snapshot_scrubbed(0, true).unwrap();
        assert!(sp.get_snapshot_scrubbing_work(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_replace_bumps_scrub_id() {
        let mut sp = SnapshotPersistor::new(None);
        sp.new_tlog();
        sp.snapshot(&name("a"), Vec::new(), Uuid::new_v4(), false).unwrap();
        write_all(&mut sp);
        let before = sp.scrub_id();
        let old = sp.get_tlogs_in_snapshot(0).unwrap();
        let new = vec![TLog::from_parts(TLogId::new(), true, 3)];

        let scrub_id = sp.replace(&old, new.clone(), 0).unwrap();
        assert_ne!(scrub_id, before);
        assert_eq!(sp.scrub_id(), scrub_id);
        assert_eq!(sp.get_tlogs_in_snapshot(0).unwrap(), vec![new[0].id()]);
        assert!(!sp.tlog_referenced(old[0]));
    }

    #[test]
    fn test_backend_sizes() {
        let mut sp = SnapshotPersistor::new(None);
        sp.add_current_backend_size(10);
        sp.snapshot(&name("a"), Vec::new(), Uuid::new_v4(), false).unwrap();
        sp.add_current_backend_size(20);
        sp.snapshot(&name("b"), Vec::new(), Uuid::new_v4(), false).unwrap();
        sp.add_current_backend_size(5);

        assert_eq!(sp.get_snapshot_backend_size(&name("b")).unwrap(), 20);
        assert_eq!(sp.get_current_backend_size(), 5);
        assert_eq!(sp.get_total_backend_size(), 35);
        assert_eq!(sp.get_backend_size(&name("b"), None).unwrap(), 30);
        assert_eq!(sp.get_backend_size(&name("b"), Some(&name("a"))).unwrap(), 20);
    }

    #[test]
    fn test_uuid_lookup() {
        let mut sp = SnapshotPersistor::new(None);
        let uuid = Uuid::new_v4();
        sp.snapshot(&name("a"), Vec::new(), uuid, false).unwrap();

        assert_eq!(sp.get_uuid(0).unwrap(), uuid);
        assert!(sp.has_snapshot_with_uuid(uuid));
        assert!(sp.check_snapshot_uuid(&name("a"), uuid));
        assert!(!sp.check_snapshot_uuid(&name("a"), Uuid::new_v4()));
        assert_eq!(sp.get_snapshot_name(0).unwrap(), name("a"));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots.xml");
        let mut sp = SnapshotPersistor::new(None);
        sp.snapshot(&name("a"), b"meta".to_vec(), Uuid::new_v4(), false).unwrap();

        sp.save_to_file(&path, SaveMode::SyncAndRename).unwrap();
        assert_eq!(SnapshotPersistor::from_file(&path).unwrap(), sp);

        sp.new_tlog();
        sp.save_to_file(&path, SaveMode::InPlace).unwrap();
        assert_eq!(SnapshotPersistor::from_file(&path).unwrap(), sp);

        // no leftover temporaries
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_faulty_file_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots.xml");
        let forensics = dir.path().join("forensics");
        fs::write(&path, "<snapshots version=\"3\"><current>").unwrap();

        let err = SnapshotPersistor::from_file_preserving(&path, &forensics).unwrap_err();
        assert!(err.is_corruption());
        let preserved: Vec<_> = fs::read_dir(&forensics).unwrap().collect();
        assert_eq!(preserved.len(), 1);

        assert!(SnapshotPersistor::from_file(dir.path().join("missing.xml")).is_err());
    }
}
