use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::object::fsync_dir;
use crate::types::{validate_name, Manifest, ManifestKey, MANIFEST_SUFFIX};

/// per-name tag counter file
const NEXT_TAG_FILE: &str = ".next-tag";

/// change counter shared by every handle on the store
const GENERATION_FILE: &str = ".generation";

/// manifest records stored as `<root>/<name>/<tag>.manifest` (CBOR)
pub struct ManifestDb {
    root: PathBuf,
    tmp: PathBuf,
    tag_lock: Mutex<()>,
}

impl ManifestDb {
    pub fn new(root: impl Into<PathBuf>, tmp: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp: tmp.into(),
            tag_lock: Mutex::new(()),
        }
    }

    /// bumped by every insert and delete, through any handle
    pub fn generation(&self) -> Result<u64> {
        let path = self.root.join(GENERATION_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse().map_err(|_| {
                Error::CorruptObjectMessage(format!("unreadable counter {}", path.display()))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_path(&path),
        }
    }

    /// writers hold the store transaction, so read-modify-write is safe
    fn bump(&self) -> Result<()> {
        let next = self.generation()? + 1;
        let path = self.root.join(GENERATION_FILE);
        let tmp_path = self.tmp.join(uuid::Uuid::new_v4().to_string());
        fs::write(&tmp_path, next.to_string()).with_path(&tmp_path)?;
        fs::rename(&tmp_path, &path).with_path(&path)
    }

    fn name_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn record_path(&self, key: &ManifestKey) -> PathBuf {
        self.name_dir(key.name())
            .join(format!("{}{}", key.tag(), MANIFEST_SUFFIX))
    }

    pub fn exists(&self, key: &ManifestKey) -> bool {
        self.record_path(key).is_file()
    }

    /// write a new record; an existing key is never replaced
    pub fn insert(&self, manifest: &Manifest) -> Result<()> {
        let key = manifest.key();
        let path = self.record_path(key);
        let dir = self.name_dir(key.name());
        fs::create_dir_all(&dir).with_path(&dir)?;

        let tmp_path = self.tmp.join(uuid::Uuid::new_v4().to_string());
        {
            let mut bytes = Vec::new();
            ciborium::into_writer(manifest, &mut bytes)?;
            let mut file = File::create(&tmp_path).with_path(&tmp_path)?;
            file.write_all(&bytes).with_path(&tmp_path)?;
            file.sync_all().with_path(&tmp_path)?;
        }

        // an extra bump on a failed insert only costs a recomputation
        self.bump()?;
        // link(2) refuses to clobber, which makes the insert atomic
        let linked = fs::hard_link(&tmp_path, &path);
        let _ = fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::ManifestExists(key.clone()));
            }
            Err(e) => return Err(e).with_path(&path),
        }
        fsync_dir(&dir)?;
        debug!(manifest = %key, root = %manifest.root(), "inserted manifest");
        Ok(())
    }

    pub fn load(&self, key: &ManifestKey) -> Result<Option<Manifest>> {
        let path = self.record_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_path(&path),
        };
        let manifest: Manifest = ciborium::from_reader(&bytes[..])?;
        if manifest.key() != key {
            return Err(Error::CorruptObjectMessage(format!(
                "manifest record {} holds key {}",
                path.display(),
                manifest.key()
            )));
        }
        Ok(Some(manifest))
    }

    pub fn delete(&self, key: &ManifestKey) -> Result<()> {
        let path = self.record_path(key);
        self.bump()?;
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::ManifestNotFound(key.clone())
            } else {
                Error::Io { path, source: e }
            }
        })?;
        debug!(manifest = %key, "deleted manifest");
        Ok(())
    }

    /// all keys, optionally restricted to names at or below `prefix`
    pub fn list(&self, prefix: Option<&str>) -> Result<BTreeSet<ManifestKey>> {
        let base = match prefix {
            Some(prefix) => {
                let prefix = prefix.trim_end_matches('/');
                validate_name(prefix)?;
                self.name_dir(prefix)
            }
            None => self.root.clone(),
        };

        let mut keys = BTreeSet::new();
        if !base.is_dir() {
            return Ok(keys);
        }

        for entry in WalkDir::new(&base).min_depth(1) {
            let entry = entry.map_err(|e| Error::Io {
                path: base.clone(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("walkdir error")),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(key) = self.key_of(entry.path()) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    /// recover the key from a record path, skipping foreign files
    fn key_of(&self, path: &Path) -> Option<ManifestKey> {
        let file_name = path.file_name()?.to_str()?;
        let tag = file_name.strip_suffix(MANIFEST_SUFFIX)?;
        let rel = path.parent()?.strip_prefix(&self.root).ok()?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?
            .join("/");
        ManifestKey::new(name, tag).ok()
    }

    /// tags of one name, without descending into nested names
    fn tags_of(&self, name: &str) -> Result<Vec<ManifestKey>> {
        validate_name(name)?;
        let dir = self.name_dir(name);
        let mut keys = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e).with_path(&dir),
        };
        for entry in entries {
            let path = entry.with_path(&dir)?.path();
            if path.is_file() {
                if let Some(key) = self.key_of(&path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// highest numeric tag currently present
    pub fn max_tag(&self, name: &str) -> Result<Option<u64>> {
        Ok(self
            .tags_of(name)?
            .iter()
            .filter_map(ManifestKey::numeric_tag)
            .max())
    }

    /// allocate the next numeric tag for `name`
    ///
    /// the counter file is flocked so concurrent processes never receive
    /// the same tag; it outlives deletions, so tags are never reused.
    pub fn next_tag(&self, name: &str) -> Result<u64> {
        validate_name(name)?;
        let _guard = self.tag_lock.lock();

        let dir = self.name_dir(name);
        fs::create_dir_all(&dir).with_path(&dir)?;
        let path = dir.join(NEXT_TAG_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_path(&path)?;
        let mut file = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            Error::Io {
                path: path.clone(),
                source: errno.into(),
            }
        })?;

        let mut content = String::new();
        file.read_to_string(&mut content).with_path(&path)?;
        let last = content.trim().parse::<u64>().unwrap_or(0);
        let next = last.max(self.max_tag(name)?.unwrap_or(0)) + 1;

        file.set_len(0).with_path(&path)?;
        file.seek(SeekFrom::Start(0)).with_path(&path)?;
        writeln!(file, "{}", next).with_path(&path)?;
        file.sync_all().with_path(&path)?;

        debug!(name, tag = next, "allocated tag");
        Ok(next)
    }

    /// keep the `keep` highest tags of `name`, delete the rest
    pub fn delete_old_by_name(&self, name: &str, keep: usize) -> Result<Vec<ManifestKey>> {
        let keys = self.tags_of(name)?;
        let excess = keys.len().saturating_sub(keep);
        let doomed: Vec<_> = keys.into_iter().take(excess).collect();
        for key in &doomed {
            self.delete(key)?;
        }
        Ok(doomed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ObjectId;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn test_db() -> (tempfile::TempDir, ManifestDb) {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("manifests")).unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        let db = ManifestDb::new(dir.path().join("manifests"), dir.path().join("tmp"));
        (dir, db)
    }

    fn manifest(key: &str) -> Manifest {
        Manifest::builder(ManifestKey::parse(key).unwrap())
            .root(ObjectId::of(key.as_bytes()))
            .build()
            .unwrap()
    }

    fn keys(db: &ManifestDb, prefix: Option<&str>) -> Vec<String> {
        db.list(prefix)
            .unwrap()
            .iter()
            .map(|k| k.to_string())
            .collect()
    }

    #[test]
    fn test_insert_and_load() {
        let (_dir, db) = test_db();
        let m = manifest("apps/web:1");
        db.insert(&m).unwrap();
        assert_eq!(db.load(m.key()).unwrap(), Some(m.clone()));
        assert!(db.exists(m.key()));
    }

    #[test]
    fn test_insert_conflict() {
        let (_dir, db) = test_db();
        db.insert(&manifest("demo:1")).unwrap();
        let other = Manifest::builder(ManifestKey::parse("demo:1").unwrap())
            .root(ObjectId::of(b"different"))
            .build()
            .unwrap();
        assert!(matches!(db.insert(&other), Err(Error::ManifestExists(_))));
        // original is untouched
        assert_eq!(db.load(other.key()).unwrap(), Some(manifest("demo:1")));
    }

    #[test]
    fn test_load_missing() {
        let (_dir, db) = test_db();
        let key = ManifestKey::parse("demo:1").unwrap();
        assert_eq!(db.load(&key).unwrap(), None);
        assert!(matches!(db.delete(&key), Err(Error::ManifestNotFound(_))));
    }

    #[test]
    fn test_list_prefix_matches_segments() {
        let (_dir, db) = test_db();
        for k in ["a/b:1", "a/b/c:1", "a/bc:1", "z:2"] {
            db.insert(&manifest(k)).unwrap();
        }
        assert_eq!(keys(&db, Some("a/b")), vec!["a/b:1", "a/b/c:1"]);
        assert_eq!(keys(&db, None).len(), 4);
        assert!(keys(&db, Some("nothing")).is_empty());
    }

    #[test]
    fn test_list_numeric_order() {
        let (_dir, db) = test_db();
        for k in ["demo:10", "demo:2", "demo:1"] {
            db.insert(&manifest(k)).unwrap();
        }
        assert_eq!(keys(&db, None), vec!["demo:1", "demo:2", "demo:10"]);
    }

    #[test]
    fn test_next_tag_never_reuses() {
        let (_dir, db) = test_db();
        assert_eq!(db.next_tag("demo").unwrap(), 1);
        assert_eq!(db.next_tag("demo").unwrap(), 2);

        db.insert(&manifest("demo:7")).unwrap();
        assert_eq!(db.next_tag("demo").unwrap(), 8);

        db.delete(&ManifestKey::parse("demo:7").unwrap()).unwrap();
        assert_eq!(db.next_tag("demo").unwrap(), 9);
        assert_eq!(db.max_tag("demo").unwrap(), None);
    }

    #[test]
    fn test_next_tag_concurrent() {
        let (_dir, db) = test_db();
        let tags = Mutex::new(HashSet::new());
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10 {
                        let tag = db.next_tag("race").unwrap();
                        assert!(tags.lock().insert(tag), "tag {} handed out twice", tag);
                    }
                });
            }
        });
        assert_eq!(tags.lock().len(), 80);
    }

    #[test]
    fn test_counter_ignored_by_listing() {
        let (_dir, db) = test_db();
        db.next_tag("demo").unwrap();
        assert!(keys(&db, None).is_empty());
    }

    #[test]
    fn test_max_tag_ignores_nested_names() {
        let (_dir, db) = test_db();
        db.insert(&manifest("a:3")).unwrap();
        db.insert(&manifest("a/b:9")).unwrap();
        db.insert(&manifest("a:beta")).unwrap();
        assert_eq!(db.max_tag("a").unwrap(), Some(3));
    }

    #[test]
    fn test_delete_old_by_name() {
        let (_dir, db) = test_db();
        for k in ["demo:1", "demo:2", "demo:10", "demo/sub:1"] {
            db.insert(&manifest(k)).unwrap();
        }
        let deleted = db.delete_old_by_name("demo", 1).unwrap();
        let deleted: Vec<_> = deleted.iter().map(|k| k.to_string()).collect();
        assert_eq!(deleted, vec!["demo:1", "demo:2"]);
        assert_eq!(keys(&db, None), vec!["demo:10", "demo/sub:1"]);
    }

    #[test]
    fn test_generation_bumps() {
        let (_dir, db) = test_db();
        let g0 = db.generation().unwrap();
        db.insert(&manifest("demo:1")).unwrap();
        let g1 = db.generation().unwrap();
        assert!(g1 > g0);
        db.delete(&ManifestKey::parse("demo:1").unwrap()).unwrap();
        assert!(db.generation().unwrap() > g1);
    }
}
