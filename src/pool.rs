//! shared object pools
//!
//! a pool is a directory with its own `objects/` and `tmp/`, laid out like
//! a store's. pooled stores resolve objects through the pool first, and
//! `reorganize` moves objects used by several stores into it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::object::ObjectDb;
use crate::ops::{closure, fsck};
use crate::store::Store;
use crate::txn::TxnHandle;

/// object database of the pool at `path`
pub fn pool_db(path: &Path) -> ObjectDb {
    ObjectDb::new(path.join("objects"), path.join("tmp"))
}

/// create the pool layout if it does not exist yet
pub fn init_pool(path: &Path) -> Result<PathBuf> {
    for dir in ["objects", "tmp"] {
        let dir = path.join(dir);
        fs::create_dir_all(&dir).with_path(&dir)?;
    }
    fs::canonicalize(path).with_path(path)
}

/// what a reorganization did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReport {
    pub stores: usize,
    /// distinct objects referenced by the participating stores
    pub objects_considered: usize,
    /// objects copied into the pool
    pub adopted: usize,
    /// store-local copies dropped in favour of the pool
    pub local_removed: usize,
    /// pool objects no participating store references
    pub pool_removed: usize,
    pub bytes_freed: u64,
}

/// attach a store to a pool
///
/// the store must pass fsck unless `force` is set; a store already pooled
/// elsewhere must be unpooled first.
pub fn enable_pooling(store: &Store, txn: &TxnHandle, pool: &Path, force: bool) -> Result<()> {
    txn.check(store)?;

    let pool = init_pool(pool)?;
    if let Some(current) = store.config().pool {
        if current == pool {
            return Ok(());
        }
        return Err(Error::IllegalState(format!(
            "store is already pooled to {}",
            current.display()
        )));
    }

    if !force {
        let report = fsck(store, txn, &[], false)?;
        if !report.is_ok() {
            return Err(Error::IllegalState(format!(
                "store has {} broken elements and {} interrupted transactions, repair it or force pooling",
                report.broken.len(),
                report.interrupted_transactions.len()
            )));
        }
    }

    store.update_config(|c| {
        c.pool = Some(pool.clone());
        Ok(())
    })?;
    store.set_pool(Some(Arc::new(pool_db(&pool))));
    info!(store = %store.path().display(), pool = %pool.display(), "pooling enabled");
    Ok(())
}

/// detach a store from its pool, copying back every object it uses
///
/// returns the number of objects copied.
pub fn disable_pooling(store: &Store, txn: &TxnHandle) -> Result<usize> {
    txn.check(store)?;
    let pool = store
        .pool_objects()
        .ok_or_else(|| Error::IllegalState("store is not pooled".to_string()))?;

    let keys: Vec<_> = store.list_manifests(None)?.into_iter().collect();
    let live = closure(store, &keys)?;

    let local = store.local_objects();
    let mut copied = 0;
    for id in live.objects() {
        if !local.contains(id) && pool.contains(id) {
            local.import_raw(&pool, id)?;
            txn.record_write();
            copied += 1;
        }
    }

    store.update_config(|c| {
        c.pool = None;
        Ok(())
    })?;
    store.set_pool(None);
    info!(store = %store.path().display(), copied, "pooling disabled");
    Ok(copied)
}

/// move objects referenced by at least `usage_threshold` stores into the pool
///
/// every store must already be pooled to the same pool and be held in a
/// transaction. all closures are gathered before anything changes; objects
/// reach the pool before any local copy is removed. pool objects none of
/// the stores reference are deleted, so the stores passed should be every
/// user of the pool.
pub fn reorganize(stores: &[(&Store, &TxnHandle)], usage_threshold: usize) -> Result<PoolReport> {
    if usage_threshold == 0 {
        return Err(Error::IllegalState(
            "usage threshold must be at least 1".to_string(),
        ));
    }
    let (first, _) = stores
        .first()
        .ok_or(Error::MissingParameter("stores"))?;
    let pool_path = first.config().pool.ok_or_else(|| {
        Error::IllegalState(format!("{} is not pooled", first.path().display()))
    })?;
    for (store, txn) in stores {
        txn.check(store)?;
        if store.config().pool.as_deref() != Some(pool_path.as_path()) {
            return Err(Error::IllegalState(format!(
                "{} is not pooled to {}",
                store.path().display(),
                pool_path.display()
            )));
        }
    }
    let pool = pool_db(&pool_path);

    // gather
    let mut users: BTreeMap<ObjectId, Vec<usize>> = BTreeMap::new();
    for (index, (store, _)) in stores.iter().enumerate() {
        let keys: Vec<_> = store.list_manifests(None)?.into_iter().collect();
        for id in closure(*store, &keys)?.objects() {
            users.entry(*id).or_default().push(index);
        }
    }

    let mut report = PoolReport {
        stores: stores.len(),
        objects_considered: users.len(),
        ..Default::default()
    };

    // adopt: copy into the pool, then drop local copies
    for (id, holders) in users.iter().filter(|(_, h)| h.len() >= usage_threshold) {
        if !pool.contains(id) {
            let source = holders
                .iter()
                .map(|&i| stores[i].0.local_objects())
                .find(|db| db.contains(id));
            match source {
                Some(db) => {
                    pool.import_raw(db, id)?;
                    report.adopted += 1;
                }
                None => {
                    warn!(object = %id, "shared object is missing everywhere");
                    continue;
                }
            }
        }
        for &i in holders {
            let (store, txn) = stores[i];
            let local = store.local_objects();
            if local.contains(id) {
                report.bytes_freed += local.remove(id)?;
                txn.record_write();
                report.local_removed += 1;
            }
        }
        debug!(object = %id, users = holders.len(), "object pooled");
    }

    // drop what no participant uses any more
    for id in pool.list()? {
        if !users.contains_key(&id) {
            report.bytes_freed += pool.remove(&id)?;
            report.pool_removed += 1;
        }
    }
    pool.remove_empty_shards()?;
    for (store, _) in stores {
        store.local_objects().remove_empty_shards()?;
    }

    info!(
        pool = %pool_path.display(),
        adopted = report.adopted,
        local_removed = report.local_removed,
        pool_removed = report.pool_removed,
        "pool reorganized"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::write_tree;
    use crate::types::{Manifest, ManifestKey, TreeBuilder};
    use tempfile::tempdir;

    fn publish(store: &Store, key: &str, files: &[(&str, &[u8])]) {
        let txn = store.begin().unwrap();
        let mut builder = TreeBuilder::new();
        for (name, content) in files {
            builder = builder.blob(*name, store.put(&txn, content).unwrap());
        }
        let root = write_tree(store, &txn, &builder.build().unwrap()).unwrap();
        let manifest = Manifest::builder(ManifestKey::parse(key).unwrap())
            .root(root)
            .build()
            .unwrap();
        store.insert_manifest(&txn, &manifest).unwrap();
        txn.commit().unwrap();
    }

    fn pooled(dir: &Path, name: &str, pool: &Path) -> Store {
        let store = Store::init(&dir.join(name)).unwrap();
        let txn = store.begin().unwrap();
        enable_pooling(&store, &txn, pool, false).unwrap();
        txn.commit().unwrap();
        store
    }

    #[test]
    fn test_enable_requires_clean_store() {
        let dir = tempdir().unwrap();
        let store = Store::init(&dir.path().join("a")).unwrap();
        publish(&store, "app:1", &[("x", b"x")]);
        store.local_objects().remove(&ObjectId::of(b"x")).unwrap();

        let txn = store.begin().unwrap();
        let pool = dir.path().join("pool");
        assert!(matches!(
            enable_pooling(&store, &txn, &pool, false),
            Err(Error::IllegalState(_))
        ));
        enable_pooling(&store, &txn, &pool, true).unwrap();
        assert!(store.pool_objects().is_some());

        let other = dir.path().join("other-pool");
        assert!(matches!(
            enable_pooling(&store, &txn, &other, true),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_reorganize_moves_shared_objects() {
        let dir = tempdir().unwrap();
        let pool = dir.path().join("pool");
        let a = pooled(dir.path(), "a", &pool);
        let b = pooled(dir.path(), "b", &pool);
        publish(&a, "app:1", &[("common", b"common"), ("own", b"only a")]);
        publish(&b, "app:1", &[("common", b"common"), ("own", b"only b")]);

        let common = ObjectId::of(b"common");
        let ta = a.begin().unwrap();
        let tb = b.begin().unwrap();
        let report = reorganize(&[(&a, &ta), (&b, &tb)], 2).unwrap();
        drop((ta, tb));

        assert_eq!(report.adopted, 1);
        assert_eq!(report.local_removed, 2);
        assert!(a.pool_objects().unwrap().contains(&common));
        assert!(!a.local_objects().contains(&common));
        assert!(!b.local_objects().contains(&common));
        // still readable through the pool
        assert_eq!(a.read(&common).unwrap(), b"common");
        assert!(a.local_objects().contains(&ObjectId::of(b"only a")));

        // new writes of pooled content stay out of local storage
        let txn = b.begin().unwrap();
        b.put(&txn, b"common").unwrap();
        assert!(!b.local_objects().contains(&common));
    }

    #[test]
    fn test_reorganize_drops_unused_pool_objects() {
        let dir = tempdir().unwrap();
        let pool = dir.path().join("pool");
        let a = pooled(dir.path(), "a", &pool);
        let stale = pool_db(&init_pool(&pool).unwrap()).write(b"stale", None).unwrap();
        publish(&a, "app:1", &[("x", b"x")]);

        let txn = a.begin().unwrap();
        let report = reorganize(&[(&a, &txn)], 2).unwrap();
        assert_eq!(report.pool_removed, 1);
        assert_eq!(report.adopted, 0);
        assert!(!a.pool_objects().unwrap().contains(&stale));
    }

    #[test]
    fn test_reorganize_rejects_unpooled_store() {
        let dir = tempdir().unwrap();
        let pool = dir.path().join("pool");
        let a = pooled(dir.path(), "a", &pool);
        let b = Store::init(&dir.path().join("b")).unwrap();

        let ta = a.begin().unwrap();
        let tb = b.begin().unwrap();
        assert!(matches!(
            reorganize(&[(&a, &ta), (&b, &tb)], 1),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            reorganize(&[(&a, &ta)], 0),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_disable_copies_back() {
        let dir = tempdir().unwrap();
        let pool = dir.path().join("pool");
        let a = pooled(dir.path(), "a", &pool);
        let b = pooled(dir.path(), "b", &pool);
        publish(&a, "app:1", &[("common", b"common")]);
        publish(&b, "app:1", &[("common", b"common")]);
        {
            let ta = a.begin().unwrap();
            let tb = b.begin().unwrap();
            reorganize(&[(&a, &ta), (&b, &tb)], 2).unwrap();
        }

        let txn = a.begin().unwrap();
        // the shared blob and the identical root tree
        assert_eq!(disable_pooling(&a, &txn).unwrap(), 2);
        assert!(a.pool_objects().is_none());
        assert!(a.config().pool.is_none());
        assert!(a.local_objects().contains(&ObjectId::of(b"common")));
        assert!(matches!(
            disable_pooling(&a, &txn),
            Err(Error::IllegalState(_))
        ));
    }
}
