use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::manifests::ManifestDb;
use crate::object::{CopyMode, ObjectDb, ObjectReader};
use crate::ops::UsageCache;
use crate::pool;
use crate::txn::{Transaction, TxnHandle, TxnManager, JOURNAL_SUFFIX};
use crate::types::{Manifest, ManifestKey};

/// a hive store on disk
///
/// ```text
/// config.toml   settings
/// objects/      content-addressed objects, sharded by two hex chars
/// manifests/    <name>/<tag>.manifest records
/// txn/          journals of open transactions
/// tmp/          staging for atomic writes
/// .lock         flock target serializing writers across processes
/// ```
pub struct Store {
    path: PathBuf,
    config: RwLock<Config>,
    objects: Arc<ObjectDb>,
    pool: RwLock<Option<Arc<ObjectDb>>>,
    manifests: ManifestDb,
    txns: TxnManager,
    usage: UsageCache,
}

impl Store {
    /// initialize a new store at the given path
    pub fn init(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if config_path.exists() {
            return Err(Error::StoreExists(path.to_path_buf()));
        }

        for dir in ["objects", "manifests", "txn", "tmp"] {
            let dir = path.join(dir);
            fs::create_dir_all(&dir).with_path(&dir)?;
        }

        let config = Config::default();
        config.save(&config_path)?;
        info!(store = %path.display(), "initialized store");

        Ok(Self::assemble(path.to_path_buf(), config))
    }

    /// open an existing store
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoStore(path.to_path_buf()));
        }
        let config = Config::load(&config_path)?;
        Ok(Self::assemble(path.to_path_buf(), config))
    }

    fn assemble(path: PathBuf, config: Config) -> Self {
        let tmp = path.join("tmp");
        let pool = config.pool.as_deref().map(|p| {
            if !p.is_dir() {
                warn!(pool = %p.display(), "configured pool is missing");
            }
            Arc::new(pool::pool_db(p))
        });
        let usage = UsageCache::new(Duration::from_secs(config.usage_cache_ttl_secs));
        Self {
            objects: Arc::new(ObjectDb::new(path.join("objects"), &tmp)),
            manifests: ManifestDb::new(path.join("manifests"), &tmp),
            pool: RwLock::new(pool),
            config: RwLock::new(config),
            txns: TxnManager::default(),
            usage,
            path,
        }
    }

    /// store root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// snapshot of the configuration
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    /// change and persist the configuration
    pub fn update_config<F: FnOnce(&mut Config) -> Result<()>>(&self, f: F) -> Result<()> {
        let mut config = self.config.write();
        let mut updated = config.clone();
        f(&mut updated)?;
        updated.save(&self.config_path())?;
        *config = updated;
        Ok(())
    }

    /// worker count for parallel phases
    pub fn jobs(&self) -> usize {
        self.config.read().jobs()
    }

    pub(crate) fn worker_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs())
            .thread_name(|i| format!("hive-worker-{}", i))
            .build()
            .map_err(|e| Error::IllegalState(format!("cannot start worker pool: {}", e)))
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.toml")
    }

    pub fn objects_path(&self) -> PathBuf {
        self.path.join("objects")
    }

    pub fn manifests_path(&self) -> PathBuf {
        self.path.join("manifests")
    }

    pub fn txn_path(&self) -> PathBuf {
        self.path.join("txn")
    }

    /// path to tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path.join(".lock")
    }

    // transactions

    /// open a write transaction, waiting for any other writer to finish
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self)
    }

    /// open a write transaction, or fail with `StoreBusy` instead of waiting
    pub fn try_begin(&self) -> Result<Transaction<'_>> {
        Transaction::try_begin(self)
    }

    pub(crate) fn txns(&self) -> &TxnManager {
        &self.txns
    }

    /// ids of transactions whose journal is on disk
    pub fn journals(&self) -> Result<Vec<String>> {
        let dir = self.txn_path();
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).with_path(&dir)? {
            let path = entry.with_path(&dir)?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if let Some(id) = name.strip_suffix(JOURNAL_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    // objects

    /// local object database
    pub fn local_objects(&self) -> &ObjectDb {
        &self.objects
    }

    /// object database of the pool, if pooled
    pub fn pool_objects(&self) -> Option<Arc<ObjectDb>> {
        self.pool.read().clone()
    }

    pub(crate) fn set_pool(&self, pool: Option<Arc<ObjectDb>>) {
        *self.pool.write() = pool;
    }

    /// the database holding `id`, pool first
    pub fn locate(&self, id: &ObjectId) -> Option<Arc<ObjectDb>> {
        if let Some(pool) = self.pool_objects() {
            if pool.contains(id) {
                return Some(pool);
            }
        }
        if self.objects.contains(id) {
            return Some(self.objects.clone());
        }
        None
    }

    fn located(&self, id: &ObjectId) -> Result<Arc<ObjectDb>> {
        self.locate(id).ok_or(Error::ObjectNotFound(*id))
    }

    pub fn exists(&self, id: &ObjectId) -> bool {
        self.locate(id).is_some()
    }

    /// store content; a no-op when it is already present here or in the pool
    pub fn put(&self, txn: &TxnHandle, content: &[u8]) -> Result<ObjectId> {
        txn.check(self)?;
        let pool = self.pool_objects();
        let id = self.objects.write(content, pool.as_deref())?;
        txn.record_write();
        Ok(id)
    }

    /// store content from a reader without buffering it
    pub fn put_streaming<R: Read>(&self, txn: &TxnHandle, reader: &mut R) -> Result<ObjectId> {
        txn.check(self)?;
        let pool = self.pool_objects();
        let id = self.objects.write_streaming(reader, pool.as_deref())?;
        txn.record_write();
        Ok(id)
    }

    /// bring an encoded object over from another database
    pub fn adopt(&self, txn: &TxnHandle, src: &ObjectDb, id: &ObjectId) -> Result<CopyMode> {
        txn.check(self)?;
        if self.exists(id) {
            return Ok(CopyMode::Skipped);
        }
        let mode = self.objects.import_raw(src, id)?;
        txn.record_write();
        Ok(mode)
    }

    /// streaming reader over an object's content
    pub fn get(&self, id: &ObjectId) -> Result<ObjectReader> {
        self.located(id)?.open(id)
    }

    pub fn read(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.located(id)?.read(id)
    }

    /// uncompressed size
    pub fn size(&self, id: &ObjectId) -> Result<u64> {
        self.located(id)?.size(id)
    }

    pub fn verify(&self, id: &ObjectId) -> Result<bool> {
        self.located(id)?.verify(id)
    }

    // manifests

    pub(crate) fn manifest_db(&self) -> &ManifestDb {
        &self.manifests
    }

    /// changes whenever a manifest is inserted or deleted
    pub fn manifest_generation(&self) -> Result<u64> {
        self.manifests.generation()
    }

    pub fn list_manifests(&self, prefix: Option<&str>) -> Result<BTreeSet<ManifestKey>> {
        self.manifests.list(prefix)
    }

    pub fn load_manifest(&self, key: &ManifestKey) -> Result<Option<Manifest>> {
        self.manifests.load(key)
    }

    /// load a manifest that must exist
    pub fn manifest(&self, key: &ManifestKey) -> Result<Manifest> {
        self.manifests
            .load(key)?
            .ok_or_else(|| Error::ManifestNotFound(key.clone()))
    }

    pub fn has_manifest(&self, key: &ManifestKey) -> bool {
        self.manifests.exists(key)
    }

    /// publish a manifest whose root tree is already stored
    pub fn insert_manifest(&self, txn: &TxnHandle, manifest: &Manifest) -> Result<()> {
        txn.check(self)?;
        if !self.exists(manifest.root()) {
            return Err(Error::ObjectNotFound(*manifest.root()));
        }
        self.manifests.insert(manifest)?;
        txn.record_write();
        Ok(())
    }

    pub fn delete_manifest(&self, txn: &TxnHandle, key: &ManifestKey) -> Result<()> {
        txn.check(self)?;
        self.manifests.delete(key)?;
        txn.record_write();
        Ok(())
    }

    pub fn delete_old_manifests(
        &self,
        txn: &TxnHandle,
        name: &str,
        keep: usize,
    ) -> Result<Vec<ManifestKey>> {
        txn.check(self)?;
        self.manifests.delete_old_by_name(name, keep)
    }

    pub fn next_tag(&self, name: &str) -> Result<u64> {
        self.manifests.next_tag(name)
    }

    pub fn max_tag(&self, name: &str) -> Result<Option<u64>> {
        self.manifests.max_tag(name)
    }

    /// the cache behind disc usage requests, for cancelling or invalidating
    pub fn usage_cache(&self) -> &UsageCache {
        &self.usage
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::init(&dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_init() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        Store::init(&path).unwrap();

        for sub in ["objects", "manifests", "txn", "tmp"] {
            assert!(path.join(sub).is_dir(), "{} missing", sub);
        }
        assert!(path.join("config.toml").is_file());
    }

    #[test]
    fn test_store_init_already_exists() {
        let (dir, _store) = test_store();
        let result = Store::init(&dir.path().join("store"));
        assert!(matches!(result, Err(Error::StoreExists(_))));
    }

    #[test]
    fn test_store_open() {
        let (dir, _store) = test_store();
        let store = Store::open(&dir.path().join("store")).unwrap();
        assert_eq!(store.path(), dir.path().join("store"));

        let missing = Store::open(&dir.path().join("nope"));
        assert!(matches!(missing, Err(Error::NoStore(_))));
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        let id = store.put(&txn, b"1").unwrap();
        let streamed = store.put_streaming(&txn, &mut &b"1"[..]).unwrap();
        txn.commit().unwrap();

        assert_eq!(id, streamed);
        assert!(store.exists(&id));
        assert_eq!(store.size(&id).unwrap(), 1);
        let mut content = String::new();
        store.get(&id).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "1");
        assert!(store.verify(&id).unwrap());
    }

    #[test]
    fn test_insert_manifest_requires_root() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        let manifest = Manifest::builder(ManifestKey::parse("demo:1").unwrap())
            .root(ObjectId::of(b"absent"))
            .build()
            .unwrap();
        assert!(matches!(
            store.insert_manifest(&txn, &manifest),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_update_config_persists() {
        let (dir, store) = test_store();
        store
            .update_config(|c| c.add_remote("origin", "/srv/hive"))
            .unwrap();
        let reopened = Store::open(&dir.path().join("store")).unwrap();
        assert_eq!(reopened.config().get_remote("origin").unwrap().url, "/srv/hive");
    }

    #[test]
    fn test_journals_listed() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        assert_eq!(store.journals().unwrap(), vec![txn.id().to_string()]);
        drop(txn);
        assert!(store.journals().unwrap().is_empty());
    }
}
