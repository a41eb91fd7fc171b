//! Metadata store synchronisation against a directory backend

use std::path::Path;
use tempfile::{TempDir, tempdir};
use uuid::Uuid;
use voldrv_backend::{BackendInterfacePtr, LocalBackend, OverwriteObject};
use voldrv_common::{Namespace, ParentConfig, SCOCloneId, SnapshotName};
use voldrv_meta_store::{
    CheckScrubId, DryRun, MetaDataStoreBuilder, MetaDataStoreInterface, RedbMetaDataStore,
};
use voldrv_snapshot::{SnapshotPersistor, TLog};

struct Volume {
    bi: BackendInterfacePtr,
    sp: SnapshotPersistor,
}

impl Volume {
    fn new(root: &Path, ns: &str, parent: Option<ParentConfig>) -> Self {
        let bi = LocalBackend::new(root.join("backend"), Namespace::new(ns).unwrap());
        bi.create_namespace().unwrap();
        Self {
            bi: bi.into_ptr(),
            sp: SnapshotPersistor::new(parent),
        }
    }

    /// Upload every pending TLog and mark it durable
    fn make_durable(&mut self) {
        for id in self.sp.get_tlogs_not_written_to_backend() {
            self.bi
                .put_object(&id.name(), id.as_uuid().as_bytes(), OverwriteObject::Yes)
                .unwrap();
            self.sp.set_tlog_written_to_backend(id).unwrap();
        }
    }

    fn snapshot(&mut self, name: &str) {
        self.sp
            .snapshot(&SnapshotName::new(name), Vec::new(), Uuid::new_v4(), false)
            .unwrap();
    }

    fn publish(&self) {
        self.sp
            .write_to_backend(self.bi.as_ref(), OverwriteObject::Yes)
            .unwrap();
    }
}

fn open_store(dir: &TempDir) -> RedbMetaDataStore {
    RedbMetaDataStore::open(dir.path().join("md").join("store.redb")).unwrap()
}

fn sync(
    store: &RedbMetaDataStore,
    vol: &Volume,
    dir: &TempDir,
    dry_run: DryRun,
) -> voldrv_meta_store::BuildResult {
    let builder = MetaDataStoreBuilder::new(store, vol.bi.clone(), dir.path().join("scratch")).unwrap();
    builder.run(None, CheckScrubId::Yes, dry_run).unwrap()
}

#[test]
fn test_full_then_incremental() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let mut vol = Volume::new(dir.path(), "vol", None);
    vol.sp.new_tlog();
    vol.sp.new_tlog();
    vol.snapshot("a");
    vol.make_durable();
    vol.sp.new_tlog();
    vol.publish();

    let res = sync(&store, &vol, &dir, DryRun::No);
    assert_eq!(res.num_tlogs, 4);
    assert_eq!(res.nsid_map.len(), 1);
    assert_eq!(store.last_cork().unwrap(), vol.sp.last_cork());
    assert_eq!(store.scrub_id().unwrap(), Some(vol.sp.scrub_id()));
    assert_eq!(
        store
            .replayed_tlogs()
            .unwrap()
            .iter()
            .map(|r| r.tlog)
            .collect::<Vec<_>>(),
        vol.sp.get_tlogs_written_to_backend()
    );

    vol.make_durable();
    vol.sp.new_tlog();
    vol.publish();
    let res = sync(&store, &vol, &dir, DryRun::No);
    assert_eq!(res.num_tlogs, 1);
    assert_eq!(store.num_replayed_tlogs().unwrap(), 5);
    assert_eq!(store.last_cork().unwrap(), vol.sp.last_cork());

    let res = sync(&store, &vol, &dir, DryRun::No);
    assert_eq!(res.num_tlogs, 0);
    assert!(res.nsid_map.is_empty());
    assert!(!dir.path().join("scratch").exists());
}

#[test]
fn test_explicit_end_cork() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let mut vol = Volume::new(dir.path(), "vol", None);
    vol.sp.new_tlog();
    vol.sp.new_tlog();
    vol.make_durable();
    vol.publish();
    let tlogs = vol.sp.get_tlogs_written_to_backend();

    let builder = MetaDataStoreBuilder::new(&store, vol.bi.clone(), dir.path().join("scratch")).unwrap();
    let res = builder
        .run(Some(tlogs[1]), CheckScrubId::Yes, DryRun::No)
        .unwrap();
    assert_eq!(res.num_tlogs, 2);
    assert_eq!(store.last_cork().unwrap(), Some(tlogs[1]));

    let res = builder.run(None, CheckScrubId::Yes, DryRun::No).unwrap();
    assert_eq!(res.num_tlogs, 1);
    assert_eq!(store.last_cork().unwrap(), Some(tlogs[2]));
}

#[test]
fn test_scrub_id_mismatch_rebuilds() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let mut vol = Volume::new(dir.path(), "vol", None);
    vol.sp.new_tlog();
    vol.sp.new_tlog();
    vol.snapshot("a");
    vol.make_durable();
    vol.sp.new_tlog();
    vol.publish();
    assert_eq!(sync(&store, &vol, &dir, DryRun::No).num_tlogs, 4);
    let old_scrub_id = store.scrub_id().unwrap();

    let scrubbed = TLog::from_parts(voldrv_common::TLogId::new(), true, 512);
    vol.bi
        .put_object(&scrubbed.name(), b"scrubbed", OverwriteObject::No)
        .unwrap();
    let old = vol.sp.get_tlogs_in_snapshot(0).unwrap();
    vol.sp.replace(&old, vec![scrubbed.clone()], 0).unwrap();
    vol.publish();

    let res = sync(&store, &vol, &dir, DryRun::Yes);
    assert_eq!(res.num_tlogs, 2);
    assert_eq!(store.scrub_id().unwrap(), old_scrub_id);
    assert_eq!(store.num_replayed_tlogs().unwrap(), 4);

    let res = sync(&store, &vol, &dir, DryRun::No);
    assert_eq!(res.num_tlogs, 2);
    assert_eq!(store.scrub_id().unwrap(), Some(vol.sp.scrub_id()));
    let replayed = store.replayed_tlogs().unwrap();
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].tlog, scrubbed.id());
    assert_eq!(replayed[0].seq, 0);
}

#[test]
fn test_rollback_falls_back_to_full_rebuild() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let mut vol = Volume::new(dir.path(), "vol", None);
    vol.snapshot("a");
    vol.sp.new_tlog();
    vol.snapshot("b");
    vol.make_durable();
    vol.publish();
    assert_eq!(sync(&store, &vol, &dir, DryRun::No).num_tlogs, 4);

    vol.sp.delete_tlogs_and_snapshots_after_snapshot(0).unwrap();
    vol.publish();

    let res = sync(&store, &vol, &dir, DryRun::No);
    assert_eq!(res.num_tlogs, 1);
    assert_eq!(store.num_replayed_tlogs().unwrap(), 1);
    assert_eq!(
        store.last_cork().unwrap(),
        vol.sp.get_snapshot_cork(&"a".into()).unwrap()
    );
}

#[test]
fn test_clone_replays_parent_tlogs() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let mut parent = Volume::new(dir.path(), "parent", None);
    parent.sp.new_tlog();
    parent.snapshot("base");
    parent.sp.new_tlog();
    parent.snapshot("later");
    parent.make_durable();
    parent.publish();

    let mut child = Volume::new(
        dir.path(),
        "child",
        Some(ParentConfig::new(Namespace::new("parent").unwrap(), "base".into())),
    );
    child.publish();

    let res = sync(&store, &child, &dir, DryRun::No);
    assert_eq!(res.num_tlogs, 2);
    assert_eq!(res.nsid_map.len(), 2);
    assert_eq!(
        res.nsid_map
            .get(SCOCloneId::new(1))
            .unwrap()
            .namespace()
            .as_str(),
        "parent"
    );
    assert_eq!(
        store.last_cork().unwrap(),
        parent.sp.get_snapshot_cork(&"base".into()).unwrap()
    );
    assert!(store.replayed_tlogs().unwrap().iter().all(|r| r.namespace == "parent"));

    child.make_durable();
    child.publish();
    let res = sync(&store, &child, &dir, DryRun::No);
    assert_eq!(res.num_tlogs, 1);
    let replayed = store.replayed_tlogs().unwrap();
    assert_eq!(replayed.len(), 3);
    assert_eq!(replayed[2].namespace, "child");
    assert_eq!(replayed[2].clone_id, SCOCloneId::BASE);
}

#[test]
fn test_missing_snapshots_object() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let vol = Volume::new(dir.path(), "vol", None);

    let builder = MetaDataStoreBuilder::new(&store, vol.bi.clone(), dir.path().join("scratch")).unwrap();
    let err = builder
        .run(None, CheckScrubId::Yes, DryRun::No)
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(store.last_cork().unwrap(), None);
}
