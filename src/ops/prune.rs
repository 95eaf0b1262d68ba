use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::hash::ObjectId;
use crate::ops::closure::closure;
use crate::store::Store;
use crate::txn::TxnHandle;

/// prune result
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// removed (or removable, on a dry run) objects and their on-disk bytes
    pub freed: BTreeMap<ObjectId, u64>,
    pub dry_run: bool,
}

impl PruneReport {
    pub fn objects(&self) -> usize {
        self.freed.len()
    }

    pub fn bytes(&self) -> u64 {
        self.freed.values().sum()
    }
}

/// delete local objects no manifest reaches
///
/// the whole mark phase completes before anything is deleted, so a dangling
/// reference aborts the run with nothing removed. pool objects are left to
/// pool reorganization.
pub fn prune(store: &Store, txn: &TxnHandle, dry_run: bool) -> Result<PruneReport> {
    txn.check(store)?;

    let keys: Vec<_> = store.list_manifests(None)?.into_iter().collect();
    let live = closure(store, &keys)?;
    debug!(
        manifests = live.manifests.len(),
        objects = live.object_count(),
        "marked live objects"
    );

    let local = store.local_objects();
    let mut report = PruneReport {
        dry_run,
        ..Default::default()
    };
    for id in local.list()? {
        if live.contains(&id) {
            continue;
        }
        let bytes = if dry_run {
            local.disk_size(&id)?
        } else {
            let bytes = local.remove(&id)?;
            txn.record_write();
            bytes
        };
        report.freed.insert(id, bytes);
    }

    if !dry_run {
        local.remove_empty_shards()?;
    }
    info!(
        objects = report.objects(),
        bytes = report.bytes(),
        dry_run,
        "prune finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::object::{write_manifest_ref, write_tree};
    use crate::types::{Manifest, ManifestKey, TreeBuilder};
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::init(&dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn key(s: &str) -> ManifestKey {
        ManifestKey::parse(s).unwrap()
    }

    #[test]
    fn test_prune_keeps_reachable() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        let kept = store.put(&txn, b"kept").unwrap();
        let orphan = store.put(&txn, b"orphan").unwrap();
        let root = write_tree(&store, &txn, &TreeBuilder::new().blob("k", kept).build().unwrap()).unwrap();
        store
            .insert_manifest(&txn, &Manifest::builder(key("app:1")).root(root).build().unwrap())
            .unwrap();

        let dry = prune(&store, &txn, true).unwrap();
        assert!(dry.dry_run);
        assert_eq!(dry.freed.keys().collect::<Vec<_>>(), vec![&orphan]);
        assert!(store.exists(&orphan));

        let report = prune(&store, &txn, false).unwrap();
        assert_eq!(report.objects(), 1);
        assert!(report.bytes() > 0);
        assert!(!store.exists(&orphan));
        assert!(store.exists(&kept));
        assert!(store.exists(&root));

        assert!(prune(&store, &txn, false).unwrap().freed.is_empty());
    }

    #[test]
    fn test_prune_follows_manifest_references() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        let lib = store.put(&txn, b"lib").unwrap();
        let base = write_tree(&store, &txn, &TreeBuilder::new().blob("lib", lib).build().unwrap()).unwrap();
        store
            .insert_manifest(&txn, &Manifest::builder(key("base:1")).root(base).build().unwrap())
            .unwrap();
        let link = write_manifest_ref(&store, &txn, &key("base:1")).unwrap();
        let app = write_tree(&store, &txn, &TreeBuilder::new().manifest_ref("base", link).build().unwrap()).unwrap();
        store
            .insert_manifest(&txn, &Manifest::builder(key("app:1")).root(app).build().unwrap())
            .unwrap();

        assert!(prune(&store, &txn, false).unwrap().freed.is_empty());
        assert!(store.exists(&link));
    }

    #[test]
    fn test_prune_aborts_on_dangling_reference() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        let orphan = store.put(&txn, b"orphan").unwrap();
        let link = write_manifest_ref(&store, &txn, &key("gone:1")).unwrap();
        let app = write_tree(&store, &txn, &TreeBuilder::new().manifest_ref("dep", link).build().unwrap()).unwrap();
        store
            .insert_manifest(&txn, &Manifest::builder(key("app:1")).root(app).build().unwrap())
            .unwrap();

        assert!(matches!(
            prune(&store, &txn, false),
            Err(Error::ManifestNotFound(_))
        ));
        assert!(store.exists(&orphan));
    }

    #[test]
    fn test_prune_after_delete_frees_everything() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        let blob = store.put(&txn, b"x").unwrap();
        let root = write_tree(&store, &txn, &TreeBuilder::new().blob("x", blob).build().unwrap()).unwrap();
        store
            .insert_manifest(&txn, &Manifest::builder(key("demo:1")).root(root).build().unwrap())
            .unwrap();
        store.delete_manifest(&txn, &key("demo:1")).unwrap();

        let report = prune(&store, &txn, false).unwrap();
        assert_eq!(report.objects(), 2);
        assert!(store.local_objects().list().unwrap().is_empty());
    }
}
