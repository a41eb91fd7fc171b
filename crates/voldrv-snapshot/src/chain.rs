//! Clone-chain traversal.
//!
//! A clone's history continues in its parent namespace up to the snapshot it
//! was cloned from, and so on up the chain. [`SnapshotPersistor::vold`]
//! collects every level of that chain and hands them to a
//! [`CloneChainVisitor`] in the order it asks for.

use crate::persistor::SnapshotPersistor;
use crate::snapshot::Snapshot;
use crate::tlog::TLogs;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info};
use voldrv_backend::BackendInterfacePtr;
use voldrv_common::{CloneTLogs, Error, OrderedTLogIds, Result, SCOCloneId, SnapshotName, TLogId};

/// Backend handle per clone level; level 0 is the volume itself
#[derive(Clone, Default)]
pub struct NSIDMap(BTreeMap<SCOCloneId, BackendInterfacePtr>);

impl NSIDMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, clone_id: SCOCloneId, bi: BackendInterfacePtr) {
        self.0.insert(clone_id, bi);
    }

    #[must_use]
    pub fn get(&self, clone_id: SCOCloneId) -> Option<&BackendInterfacePtr> {
        self.0.get(&clone_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SCOCloneId, &BackendInterfacePtr)> {
        self.0.iter().map(|(id, bi)| (*id, bi))
    }
}

impl fmt::Debug for NSIDMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(id, bi)| (id, bi.namespace())))
            .finish()
    }
}

/// Order in which [`SnapshotPersistor::vold`] presents the levels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The volume itself first, then its ancestors
    NewestFirst,
    /// The root ancestor first, the volume itself last
    OldestFirst,
}

/// One level of a clone chain
pub struct CloneLevel<'a> {
    pub clone_id: SCOCloneId,
    pub persistor: Cow<'a, SnapshotPersistor>,
    pub backend: BackendInterfacePtr,
    /// Snapshot the child was cloned from; for level 0 whatever the caller
    /// passed to `vold`
    pub boundary: Option<SnapshotName>,
}

impl CloneLevel<'_> {
    /// Snapshots up to and including the boundary, or all of them without one
    pub fn snapshots_till_boundary(&self) -> Result<&[Snapshot]> {
        let snapshots = self.persistor.snapshots();
        match &self.boundary {
            Some(name) => {
                let pos = snapshots
                    .iter()
                    .position(|s| s.name() == name)
                    .ok_or_else(|| {
                        error!(
                            "Boundary snapshot {} not found in namespace {}",
                            name,
                            self.backend.namespace()
                        );
                        Error::snapshot_not_found(format!("name {name}"))
                    })?;
                Ok(&snapshots[..=pos])
            }
            None => Ok(&snapshots[..]),
        }
    }

    fn boundary(&self) -> Result<&SnapshotName> {
        self.boundary.as_ref().ok_or_else(|| {
            Error::invalid_argument(format!(
                "clone level {} needs a boundary snapshot",
                self.clone_id
            ))
        })
    }
}

pub trait CloneChainVisitor {
    fn direction(&self) -> Direction;

    fn visit(&mut self, level: &CloneLevel<'_>) -> Result<()>;
}

impl SnapshotPersistor {
    /// Walk the clone chain starting at this persistor.
    ///
    /// `bi` is the backend of this persistor's namespace and `snapshot` the
    /// boundary for level 0, if any. Ancestors are loaded from their
    /// namespaces before the visitor sees the first level.
    pub fn vold<V: CloneChainVisitor>(
        &self,
        visitor: &mut V,
        bi: BackendInterfacePtr,
        snapshot: Option<&SnapshotName>,
    ) -> Result<()> {
        let mut levels = vec![CloneLevel {
            clone_id: SCOCloneId::BASE,
            persistor: Cow::Borrowed(self),
            backend: bi,
            boundary: snapshot.cloned(),
        }];

        while let Some(parent) = levels.last().and_then(|l| l.persistor.parent().cloned()) {
            let child = &levels[levels.len() - 1];
            let clone_id = child.clone_id.parent().ok_or_else(|| {
                Error::invalid_argument(format!(
                    "clone chain of {} is too deep",
                    levels[0].backend.namespace()
                ))
            })?;
            let backend = child.backend.clone_with_new_namespace(&parent.namespace);
            let persistor = SnapshotPersistor::from_backend(backend.as_ref())?;
            debug!(
                "Clone level {}: namespace {}, boundary snapshot {}",
                clone_id, parent.namespace, parent.snapshot
            );
            levels.push(CloneLevel {
                clone_id,
                persistor: Cow::Owned(persistor),
                backend,
                boundary: Some(parent.snapshot),
            });
        }

        match visitor.direction() {
            Direction::NewestFirst => levels.iter().try_for_each(|l| visitor.visit(l)),
            Direction::OldestFirst => levels.iter().rev().try_for_each(|l| visitor.visit(l)),
        }
    }
}

/// Collects the backend handle of every level
#[derive(Debug, Default)]
pub struct NSIDMapBuilder {
    nsid_map: NSIDMap,
}

impl NSIDMapBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_nsid_map(self) -> NSIDMap {
        self.nsid_map
    }
}

impl CloneChainVisitor for NSIDMapBuilder {
    fn direction(&self) -> Direction {
        Direction::NewestFirst
    }

    fn visit(&mut self, level: &CloneLevel<'_>) -> Result<()> {
        self.nsid_map.set(level.clone_id, level.backend.clone());
        Ok(())
    }
}

/// Collects the durable TLogs in `(start_cork, end_cork]` across the chain.
///
/// Ancestors contribute their TLogs up to the boundary snapshot, level 0 its
/// durable TLogs. A snapshot cork that no longer names one of the snapshot's
/// TLogs (after scrubbing) still matches at the end of that snapshot.
#[derive(Debug)]
pub struct BackendRestartAccumulator {
    nsid_map: NSIDMap,
    clone_tlogs: CloneTLogs,
    start_cork: Option<TLogId>,
    end_cork: Option<TLogId>,
    start_seen: bool,
    end_seen: bool,
}

impl BackendRestartAccumulator {
    #[must_use]
    pub fn new(start_cork: Option<TLogId>, end_cork: Option<TLogId>) -> Self {
        Self {
            nsid_map: NSIDMap::new(),
            clone_tlogs: CloneTLogs::new(),
            start_cork,
            end_cork,
            start_seen: start_cork.is_none(),
            end_seen: false,
        }
    }

    fn take(&mut self, tlogs: &TLogs, out: &mut OrderedTLogIds) -> bool {
        for tlog in tlogs {
            if self.end_seen {
                break;
            }
            if !tlog.written_to_backend() {
                return false;
            }
            self.take_id(tlog.id(), out);
        }
        true
    }

    fn take_id(&mut self, id: TLogId, out: &mut OrderedTLogIds) {
        if self.start_seen {
            out.push(id);
            if Some(id) == self.end_cork {
                self.end_seen = true;
            }
        } else if Some(id) == self.start_cork {
            self.start_seen = true;
            self.end_seen = self.end_cork == self.start_cork;
        }
    }

    fn check_snapshot_cork(&mut self, cork: Option<TLogId>) {
        if cork.is_none() || self.end_seen {
            return;
        }
        if !self.start_seen && cork == self.start_cork {
            self.start_seen = true;
            self.end_seen = self.end_cork == self.start_cork;
        } else if self.start_seen && cork == self.end_cork {
            self.end_seen = true;
        }
    }

    #[must_use]
    pub const fn nsid_map(&self) -> &NSIDMap {
        &self.nsid_map
    }

    /// The collected TLogs per level, oldest level first, and the handles
    /// of all levels visited
    pub fn into_parts(self) -> Result<(CloneTLogs, NSIDMap)> {
        if !self.start_seen {
            error!("Start cork {:?} not found in the clone chain", self.start_cork);
            return Err(Error::CorkNotFound(cork_str(self.start_cork)));
        }
        if self.end_cork.is_some() && !self.end_seen {
            error!("End cork {:?} not found in the clone chain", self.end_cork);
            return Err(Error::CorkNotFound(cork_str(self.end_cork)));
        }
        Ok((self.clone_tlogs, self.nsid_map))
    }
}

impl CloneChainVisitor for BackendRestartAccumulator {
    fn direction(&self) -> Direction {
        Direction::OldestFirst
    }

    fn visit(&mut self, level: &CloneLevel<'_>) -> Result<()> {
        self.nsid_map.set(level.clone_id, level.backend.clone());
        let is_base = level.clone_id == SCOCloneId::BASE;
        let snapshots: &[Snapshot] = if is_base {
            level.persistor.snapshots()
        } else {
            level.snapshots_till_boundary()?
        };

        let mut tlogs = OrderedTLogIds::new();
        let mut durable = true;
        for snapshot in snapshots {
            durable = self.take(snapshot.tlogs(), &mut tlogs);
            if !durable {
                break;
            }
            self.check_snapshot_cork(snapshot.cork());
        }
        if is_base && durable {
            self.take(level.persistor.current(), &mut tlogs);
        }

        debug!("Clone level {}: {} TLogs to replay", level.clone_id, tlogs.len());
        if is_base || !tlogs.is_empty() {
            self.clone_tlogs.push((level.clone_id, tlogs));
        }
        Ok(())
    }
}

/// Collects, per level, the TLogs up to the boundary snapshot and the
/// backend size they occupy. Level 0 needs the end snapshot of the backup
/// as its boundary.
#[derive(Debug, Default)]
pub struct BackupAccumulator {
    nsid_map: NSIDMap,
    clone_tlogs: CloneTLogs,
    total_size: u64,
}

impl BackupAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn clone_tlogs(&self) -> &CloneTLogs {
        &self.clone_tlogs
    }

    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    #[must_use]
    pub const fn nsid_map(&self) -> &NSIDMap {
        &self.nsid_map
    }

    #[must_use]
    pub fn into_parts(self) -> (CloneTLogs, NSIDMap, u64) {
        (self.clone_tlogs, self.nsid_map, self.total_size)
    }
}

impl CloneChainVisitor for BackupAccumulator {
    fn direction(&self) -> Direction {
        Direction::OldestFirst
    }

    fn visit(&mut self, level: &CloneLevel<'_>) -> Result<()> {
        let boundary = level.boundary()?;
        let tlogs = level.persistor.get_tlogs_till_snapshot_name(boundary)?;
        self.total_size += level.persistor.get_backend_size(boundary, None)?;
        self.nsid_map.set(level.clone_id, level.backend.clone());
        self.clone_tlogs.push((level.clone_id, tlogs));
        Ok(())
    }
}

/// TLogs a freshly created clone inherits: nothing of its own, each
/// ancestor's TLogs up to its boundary snapshot
#[derive(Debug, Default)]
pub struct CloneFromParentAccumulator {
    nsid_map: NSIDMap,
    clone_tlogs: CloneTLogs,
}

impl CloneFromParentAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_parts(self) -> (CloneTLogs, NSIDMap) {
        (self.clone_tlogs, self.nsid_map)
    }
}

impl CloneChainVisitor for CloneFromParentAccumulator {
    fn direction(&self) -> Direction {
        Direction::OldestFirst
    }

    fn visit(&mut self, level: &CloneLevel<'_>) -> Result<()> {
        self.nsid_map.set(level.clone_id, level.backend.clone());
        let tlogs = if level.clone_id == SCOCloneId::BASE {
            OrderedTLogIds::new()
        } else {
            level
                .persistor
                .get_tlogs_till_snapshot_name(level.boundary()?)?
        };
        self.clone_tlogs.push((level.clone_id, tlogs));
        Ok(())
    }
}

/// The newest durable cork of `sp`, or, for a clone without durable TLogs
/// of its own, the cork its ancestors end at
pub fn effective_last_cork(sp: &SnapshotPersistor, bi: BackendInterfacePtr) -> Result<Option<TLogId>> {
    if let Some(cork) = sp.last_cork() {
        return Ok(Some(cork));
    }

    let mut bi = bi;
    let mut parent = sp.parent().cloned();
    while let Some(p) = parent {
        bi = bi.clone_with_new_namespace(&p.namespace);
        let level = CloneLevel {
            clone_id: SCOCloneId::BASE,
            persistor: Cow::Owned(SnapshotPersistor::from_backend(bi.as_ref())?),
            backend: bi.clone(),
            boundary: Some(p.snapshot),
        };
        if let Some(cork) = level
            .snapshots_till_boundary()?
            .iter()
            .rev()
            .find_map(Snapshot::cork)
        {
            info!("Using cork {} of parent namespace {}", cork, p.namespace);
            return Ok(Some(cork));
        }
        parent = level.persistor.parent().cloned();
    }
    Ok(None)
}

fn cork_str(cork: Option<TLogId>) -> String {
    cork.map_or_else(|| "none".to_string(), |c| c.to_string())
}
