//! Bring a metadata store in sync with the TLogs the backend holds.
//!
//! The store remembers the cork it was last synced to. An update replays the
//! durable TLogs after that cork, across the whole clone chain. A store built
//! under a different scrub generation, or whose cork no longer exists (after
//! a snapshot rollback), is rebuilt from scratch.

use crate::store::MetaDataStoreInterface;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use voldrv_backend::BackendInterfacePtr;
use voldrv_common::{Result, SCOCloneId, TLogId};
use voldrv_snapshot::{BackendRestartAccumulator, NSIDMap, SnapshotPersistor, effective_last_cork};

/// Whether a scrub generation mismatch forces a rebuild
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckScrubId {
    Yes,
    No,
}

/// Report what would be replayed without touching the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DryRun {
    Yes,
    No,
}

#[derive(Debug, Default)]
pub struct BuildResult {
    /// Backend handles of the clone levels the replayed TLogs came from;
    /// empty if nothing had to be done
    pub nsid_map: NSIDMap,
    pub num_tlogs: usize,
}

pub struct MetaDataStoreBuilder<'a, M: MetaDataStoreInterface + ?Sized> {
    mdstore: &'a M,
    bi: BackendInterfacePtr,
    scratch_dir: PathBuf,
}

impl<'a, M: MetaDataStoreInterface + ?Sized> MetaDataStoreBuilder<'a, M> {
    /// `scratch_dir` is created now and removed with the builder
    pub fn new(mdstore: &'a M, bi: BackendInterfacePtr, scratch_dir: impl Into<PathBuf>) -> Result<Self> {
        let scratch_dir = scratch_dir.into();
        fs::create_dir_all(&scratch_dir)?;
        Ok(Self {
            mdstore,
            bi,
            scratch_dir,
        })
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Sync the store up to `end_cork`, or up to the newest durable cork of
    /// the chain.
    ///
    /// # Panics
    ///
    /// Panics if the store has a cork but no scrub id, or if the chain walk
    /// does not end at the volume itself.
    pub fn run(&self, end_cork: Option<TLogId>, check_scrub_id: CheckScrubId, dry_run: DryRun) -> Result<BuildResult> {
        let start_cork = self.mdstore.last_cork()?;
        match self.update(start_cork, end_cork, check_scrub_id, dry_run) {
            Err(e) if e.is_cork_not_found() => {
                info!("Cork not found on backend - could be caused by a snapshot rollback");
            }
            other => return other,
        }

        info!("{}: retrying from clean slate", self.bi.namespace());
        if dry_run == DryRun::No {
            self.mdstore.clear_all_keys()?;
        }
        self.update(None, end_cork, check_scrub_id, dry_run)
    }

    fn update(
        &self,
        from: Option<TLogId>,
        to: Option<TLogId>,
        check_scrub_id: CheckScrubId,
        dry_run: DryRun,
    ) -> Result<BuildResult> {
        let ns = self.bi.namespace();
        info!(
            "{}: bringing metadata store in sync with backend, requested interval ({:?}, {:?}], check scrub id: {:?}, dry run: {:?}",
            ns, from, to, check_scrub_id, dry_run
        );

        let mut sp = SnapshotPersistor::from_backend(self.bi.as_ref())?;
        sp.trim_to_backend();

        let sp_scrub_id = sp.scrub_id();
        let mut start_cork = from;

        if check_scrub_id == CheckScrubId::Yes {
            match self.mdstore.scrub_id()? {
                Some(md_scrub_id) if md_scrub_id != sp_scrub_id => {
                    warn!(
                        "{}: scrub id mismatch - snapshots say {} while the metadata store has {}",
                        ns, sp_scrub_id, md_scrub_id
                    );
                    if dry_run == DryRun::Yes {
                        warn!("{}: assuming the metadata store has to be rebuilt from scratch", ns);
                    } else {
                        warn!("{}: clearing the metadata store!", ns);
                        self.mdstore.clear_all_keys()?;
                    }
                    start_cork = None;
                }
                Some(_) => {}
                None => {
                    info!("{}: no scrub id found in the metadata store", ns);
                    assert!(
                        self.mdstore.last_cork()?.is_none(),
                        "metadata store has a cork but no scrub id"
                    );
                }
            }
        }

        let end_cork = match to {
            Some(cork) => Some(cork),
            None => effective_last_cork(&sp, self.bi.clone())?,
        };

        info!("{}: adjusted interval ({:?}, {:?}]", ns, start_cork, end_cork);

        let mut res = BuildResult::default();
        if start_cork.is_some() && start_cork == end_cork {
            info!("{}: requested interval already present, nothing to do", ns);
            return Ok(res);
        }

        info!("{}: determining the TLogs to replay", ns);
        let mut acc = BackendRestartAccumulator::new(start_cork, end_cork);
        sp.vold(&mut acc, self.bi.clone(), None)?;
        let (tlogs, nsid_map) = acc.into_parts()?;

        assert!(tlogs.len() <= nsid_map.len());
        assert!(
            tlogs.last().is_some_and(|(clone_id, _)| *clone_id == SCOCloneId::BASE),
            "TLogs to replay must end at the volume itself"
        );

        res.num_tlogs = tlogs.iter().map(|(_, t)| t.len()).sum();

        if dry_run == DryRun::No {
            info!("{}: replaying {} TLogs", ns, res.num_tlogs);
            self.mdstore.set_scrub_id(sp_scrub_id)?;
            self.mdstore
                .process_clone_tlogs(&tlogs, &nsid_map, &self.scratch_dir, true, end_cork)?;
        }

        res.nsid_map = nsid_map;
        Ok(res)
    }
}

impl<M: MetaDataStoreInterface + ?Sized> Drop for MetaDataStoreBuilder<'_, M> {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.scratch_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!(
                "Failed to remove scratch directory {:?}: {}",
                self.scratch_dir, e
            ),
        }
    }
}
