//! Snapshots and the ordered snapshot chain of one volume generation.

use crate::tlog::{TLog, TLogs};
use std::ops::Deref;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use voldrv_common::{
    Error, OrderedTLogIds, Result, SnapshotMetaData, SnapshotName, SnapshotNum, TLogId,
};

/// A named, immutable checkpoint sealing a run of TLogs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    num: SnapshotNum,
    name: SnapshotName,
    uuid: Uuid,
    metadata: SnapshotMetaData,
    pub(crate) scrubbed: bool,
    date: String,
    cork: Option<TLogId>,
    pub(crate) tlogs: TLogs,
}

impl Snapshot {
    /// Seal `tlogs` under `name`; the cork is the id of the newest TLog
    pub(crate) fn new(
        num: SnapshotNum,
        name: SnapshotName,
        tlogs: TLogs,
        metadata: SnapshotMetaData,
        uuid: Uuid,
        scrubbed: bool,
    ) -> Self {
        let cork = tlogs.last().map(TLog::id);
        Self {
            num,
            name,
            uuid,
            metadata,
            scrubbed,
            date: chrono::Local::now().format("%FT%T").to_string(),
            cork,
            tlogs,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) const fn from_parts(
        num: SnapshotNum,
        name: SnapshotName,
        uuid: Uuid,
        metadata: SnapshotMetaData,
        scrubbed: bool,
        date: String,
        cork: Option<TLogId>,
        tlogs: TLogs,
    ) -> Self {
        Self {
            num,
            name,
            uuid,
            metadata,
            scrubbed,
            date,
            cork,
            tlogs,
        }
    }

    #[must_use]
    pub const fn num(&self) -> SnapshotNum {
        self.num
    }

    #[must_use]
    pub const fn name(&self) -> &SnapshotName {
        &self.name
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    #[must_use]
    pub const fn scrubbed(&self) -> bool {
        self.scrubbed
    }

    /// Creation time, local time formatted as `YYYY-MM-DDThh:mm:ss`
    #[must_use]
    pub fn date(&self) -> &str {
        &self.date
    }

    /// Id of the newest TLog at creation time.
    ///
    /// Survives scrubbing, so it may no longer name a TLog of this snapshot.
    #[must_use]
    pub const fn cork(&self) -> Option<TLogId> {
        self.cork
    }

    #[must_use]
    pub const fn tlogs(&self) -> &TLogs {
        &self.tlogs
    }

    /// All TLogs of the snapshot are durable
    #[must_use]
    pub fn in_backend(&self) -> bool {
        self.tlogs.written_to_backend()
    }

    #[must_use]
    pub fn backend_size(&self) -> u64 {
        self.tlogs.backend_size()
    }

    /// Like [`TLogs::reversed_tlogs_on_backend_since`], but a durable
    /// snapshot whose cork equals `cork` terminates the walk right away
    pub(crate) fn reversed_tlogs_on_backend_since(
        &self,
        cork: Option<TLogId>,
        reversed: &mut OrderedTLogIds,
    ) -> Result<bool> {
        if cork.is_some() && self.cork == cork && self.in_backend() {
            return Ok(true);
        }
        self.tlogs.reversed_tlogs_on_backend_since(cork, reversed)
    }
}

/// Selection of snapshots to be scrubbed
pub type SnapshotWork = Vec<SnapshotName>;

/// Ordered chain of snapshots, oldest first
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshots {
    list: Vec<Snapshot>,
    /// Lowest number not handed out yet; never decreases
    next_num: SnapshotNum,
}

impl Deref for Snapshots {
    type Target = [Snapshot];

    fn deref(&self) -> &[Snapshot] {
        &self.list
    }
}

impl Snapshots {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            list: Vec::new(),
            next_num: 0,
        }
    }

    /// Chain loaded from an image; `next_num` is raised past the newest
    /// snapshot if the stored value lags behind
    pub(crate) fn from_parts(list: Vec<Snapshot>, next_num: SnapshotNum) -> Self {
        let next_num = list.last().map_or(next_num, |s| next_num.max(s.num + 1));
        Self { list, next_num }
    }

    pub(crate) fn push(&mut self, snapshot: Snapshot) {
        self.next_num = self.next_num.max(snapshot.num + 1);
        self.list.push(snapshot);
    }

    pub(crate) fn pop(&mut self) -> Option<Snapshot> {
        self.list.pop()
    }

    /// Remove the snapshot at `pos` and every later one
    pub(crate) fn split_off(&mut self, pos: usize) -> Vec<Snapshot> {
        self.list.split_off(pos)
    }

    /// Number for the next snapshot. Numbers of deleted or rolled back
    /// snapshots are not handed out again.
    #[must_use]
    pub const fn next_snapshot_num(&self) -> SnapshotNum {
        self.next_num
    }

    #[must_use]
    pub fn find_by_name(&self, name: &SnapshotName) -> Option<&Snapshot> {
        self.list.iter().find(|s| &s.name == name)
    }

    #[must_use]
    pub fn find_by_num(&self, num: SnapshotNum) -> Option<&Snapshot> {
        self.list.iter().find(|s| s.num == num)
    }

    #[must_use]
    pub fn find_by_uuid(&self, uuid: Uuid) -> Option<&Snapshot> {
        self.list.iter().find(|s| s.uuid == uuid)
    }

    pub fn get_by_name(&self, name: &SnapshotName) -> Result<&Snapshot> {
        self.find_by_name(name)
            .ok_or_else(|| not_found(format!("name {name}")))
    }

    pub fn get_by_num(&self, num: SnapshotNum) -> Result<&Snapshot> {
        self.find_by_num(num)
            .ok_or_else(|| not_found(format!("num {num}")))
    }

    pub fn get_by_uuid(&self, uuid: Uuid) -> Result<&Snapshot> {
        self.find_by_uuid(uuid)
            .ok_or_else(|| not_found(format!("uuid {uuid}")))
    }

    pub(crate) fn get_by_num_mut(&mut self, num: SnapshotNum) -> Result<&mut Snapshot> {
        self.list
            .iter_mut()
            .find(|s| s.num == num)
            .ok_or_else(|| not_found(format!("num {num}")))
    }

    fn position_by_num(&self, num: SnapshotNum) -> Result<usize> {
        self.list
            .iter()
            .position(|s| s.num == num)
            .ok_or_else(|| not_found(format!("num {num}")))
    }

    fn position_by_name(&self, name: &SnapshotName) -> Result<usize> {
        self.list
            .iter()
            .position(|s| &s.name == name)
            .ok_or_else(|| not_found(format!("name {name}")))
    }

    /// Whether the snapshot called `name` exists and carries `uuid`
    #[must_use]
    pub fn check_snapshot_uuid(&self, name: &SnapshotName, uuid: Uuid) -> bool {
        self.find_by_name(name).is_some_and(|s| s.uuid == uuid)
    }

    pub fn get_tlogs_in_snapshot(&self, num: SnapshotNum) -> Result<OrderedTLogIds> {
        Ok(self.get_by_num(num)?.tlogs.ids())
    }

    /// Numbers of the snapshots before `num`, and `num` itself if `including`
    pub fn get_snapshots_till(&self, num: SnapshotNum, including: bool) -> Result<Vec<SnapshotNum>> {
        let pos = self.position_by_num(num)?;
        let end = if including { pos + 1 } else { pos };
        Ok(self.list[..end].iter().map(|s| s.num).collect())
    }

    /// Numbers of the snapshots after `num`
    pub fn get_snapshots_after(&self, num: SnapshotNum) -> Result<Vec<SnapshotNum>> {
        let pos = self.position_by_num(num)?;
        Ok(self.list[pos + 1..].iter().map(|s| s.num).collect())
    }

    #[must_use]
    pub fn get_all_snapshots(&self) -> Vec<SnapshotNum> {
        self.list.iter().map(|s| s.num).collect()
    }

    /// Remove snapshot `num` without dropping its TLogs: they move to the
    /// front of the following snapshot (which then needs scrubbing again),
    /// or to the front of `current` if `num` was the last snapshot.
    pub fn delete_snapshot(&mut self, num: SnapshotNum, current: &mut TLogs) -> Result<()> {
        let pos = self.position_by_num(num)?;
        let deleted = self.list.remove(pos);
        match self.list.get_mut(pos) {
            Some(next) => {
                debug!(
                    "Merging TLogs of snapshot {} into snapshot {}",
                    deleted.name, next.name
                );
                next.tlogs.prepend(deleted.tlogs);
                next.scrubbed = false;
            }
            None => {
                debug!("Merging TLogs of snapshot {} into current", deleted.name);
                current.prepend(deleted.tlogs);
            }
        }
        Ok(())
    }

    /// Merge every snapshot's TLogs into the last snapshot
    ///
    /// # Panics
    ///
    /// Panics if the chain is empty.
    pub fn delete_all_but_last_snapshot(&mut self) {
        let Some(mut last) = self.list.pop() else {
            panic!("delete_all_but_last_snapshot called on an empty snapshot chain");
        };
        let mut merged = TLogs::new();
        for snapshot in self.list.drain(..) {
            merged.push_all(snapshot.tlogs);
        }
        if !merged.is_empty() {
            last.tlogs.prepend(merged);
            last.scrubbed = false;
        }
        self.list.push(last);
    }

    /// Drop every snapshot after `num`
    pub fn delete_tlogs_and_snapshots_after_snapshot(&mut self, num: SnapshotNum) -> Result<()> {
        let pos = self.position_by_num(num)?;
        for dropped in self.list.split_off(pos + 1) {
            info!("Dropping snapshot {}", dropped.name);
        }
        Ok(())
    }

    /// TLogs of all snapshots up to and including `num`
    pub fn get_tlogs_till_snapshot(&self, num: SnapshotNum) -> Result<OrderedTLogIds> {
        let pos = self.position_by_num(num)?;
        Ok(self.list[..=pos]
            .iter()
            .flat_map(|s| s.tlogs.iter().map(TLog::id))
            .collect())
    }

    /// TLogs of all snapshots after `num`
    pub fn get_tlogs_after_snapshot(&self, num: SnapshotNum) -> Result<OrderedTLogIds> {
        let pos = self.position_by_num(num)?;
        Ok(self.list[pos + 1..]
            .iter()
            .flat_map(|s| s.tlogs.iter().map(TLog::id))
            .collect())
    }

    /// TLogs of the snapshots strictly after `start` up to `end`, including
    /// `end`'s own TLogs if `including_end`
    pub fn get_tlogs_between_snapshots(
        &self,
        start: SnapshotNum,
        end: SnapshotNum,
        including_end: bool,
    ) -> Result<OrderedTLogIds> {
        if start > end {
            error!("Start snapshot {} is bigger than end snapshot {}", start, end);
            return Err(Error::InvalidRange(format!(
                "start snapshot {start} after end snapshot {end}"
            )));
        }
        self.position_by_num(start)?;
        self.position_by_num(end)?;
        Ok(self
            .list
            .iter()
            .filter(|s| (s.num > start && s.num < end) || (including_end && s.num == end))
            .flat_map(|s| s.tlogs.iter().map(TLog::id))
            .collect())
    }

    /// Truncate the snapshot containing `id` after it and drop every later
    /// snapshot. Returns whether `id` was found.
    pub fn snip(&mut self, id: TLogId, backend_size: Option<u64>) -> bool {
        let Some(pos) = self.list.iter().position(|s| s.tlogs.tlog_referenced(id)) else {
            return false;
        };
        info!("Snipping at snapshot {} tlog {}", self.list[pos].name, id);
        self.list[pos].tlogs.snip(id, backend_size);
        for dropped in self.list.split_off(pos + 1) {
            info!("Snipping away snapshot {}", dropped.name);
        }
        true
    }

    #[must_use]
    pub fn total_backend_size(&self) -> u64 {
        self.list.iter().map(Snapshot::backend_size).sum()
    }

    /// Backend size of the snapshots after `start` (or from the first one)
    /// up to and including `end`
    pub fn backend_size(&self, end: &SnapshotName, start: Option<&SnapshotName>) -> Result<u64> {
        let first = match start {
            Some(name) => self.position_by_name(name)? + 1,
            None => 0,
        };
        let last = self.position_by_name(end)?;
        if last + 1 < first {
            warn!(
                "End snapshot {} precedes start snapshot {:?}, arguments are probably wrong",
                end, start
            );
            return Err(Error::InvalidRange(format!(
                "end snapshot {end} precedes start snapshot"
            )));
        }
        Ok(self.list[first..=last]
            .iter()
            .map(Snapshot::backend_size)
            .sum())
    }

    /// Swap the TLogs of snapshot `num` for a scrub result.
    ///
    /// `old_ids` must match the snapshot's current TLogs exactly. Applying a
    /// result that is already in place is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if any of `new_tlogs` is not durable.
    pub fn replace(
        &mut self,
        old_ids: &[TLogId],
        new_tlogs: Vec<TLog>,
        num: SnapshotNum,
    ) -> Result<()> {
        for tlog in &new_tlogs {
            assert!(
                tlog.written_to_backend(),
                "scrub result TLog {} is not written to backend",
                tlog.id()
            );
        }

        let snapshot = self.get_by_num_mut(num)?;
        if !new_tlogs.is_empty() && *snapshot.tlogs == new_tlogs[..] {
            info!(
                "Snapshot {} ({}): already replaced",
                snapshot.uuid, snapshot.name
            );
            return Ok(());
        }
        if !snapshot.tlogs.has_ids(old_ids) {
            warn!(
                "Not replacing TLogs of snapshot {}: snapshot has changed",
                snapshot.name
            );
            return Err(Error::ReplaceMismatch(snapshot.name.clone()));
        }
        if new_tlogs.is_empty() {
            error!(
                "Result of a scrub of snapshot {} cannot be empty, refusing replace",
                snapshot.name
            );
            return Err(Error::EmptyReplacement(snapshot.name.clone()));
        }
        snapshot.tlogs.reset(new_tlogs);
        Ok(())
    }

    /// Snapshots in `(start, end]` that are durable but not scrubbed yet
    pub fn snapshot_scrubbing_work(
        &self,
        start: Option<&SnapshotName>,
        end: Option<&SnapshotName>,
    ) -> Result<SnapshotWork> {
        let first = match start {
            Some(name) => self.position_by_name(name).map_err(|e| {
                error!("Requested start snapshot {} does not exist", name);
                e
            })? + 1,
            None => 0,
        };
        let stop = match end {
            Some(name) => self.position_by_name(name).map_err(|e| {
                error!("Requested end snapshot {} does not exist", name);
                e
            })? + 1,
            None => self.list.len(),
        };
        if stop < first {
            error!(
                "Requested end snapshot {:?} precedes requested start snapshot {:?}",
                end, start
            );
            return Err(Error::InvalidRange(
                "requested end snapshot precedes requested start snapshot".into(),
            ));
        }
        Ok(self.list[first..stop]
            .iter()
            .filter(|s| !s.scrubbed && s.in_backend())
            .map(|s| s.name.clone())
            .collect())
    }

    #[must_use]
    pub fn tlog_referenced(&self, id: TLogId) -> bool {
        self.list.iter().any(|s| s.tlogs.tlog_referenced(id))
    }

    /// `None` if no snapshot holds the TLog
    #[must_use]
    pub fn is_tlog_written_to_backend(&self, id: TLogId) -> Option<bool> {
        self.list
            .iter()
            .find_map(|s| s.tlogs.is_tlog_written_to_backend(id))
    }

    /// Mark `id` durable, checking every TLog of earlier snapshots and of
    /// the containing snapshot up to `id` is durable already
    pub fn set_tlog_written_to_backend(&mut self, id: TLogId) -> Result<bool> {
        for snapshot in &mut self.list {
            if snapshot.tlogs.set_tlog_written_to_backend(id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn not_found(what: String) -> Error {
    Error::SnapshotNotFound(what)
}
