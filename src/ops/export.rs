use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::object::{read_manifest_ref, read_tree};
use crate::store::Store;
use crate::types::{EntryType, ManifestKey};

/// what an export wrote
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// materialize a tree into `target`, which must be missing or empty
///
/// manifest references become sub-directories holding the referenced root.
pub fn export_tree(store: &Store, root: &ObjectId, target: &Path) -> Result<ExportStats> {
    check_target(target)?;
    fs::create_dir_all(target).with_path(target)?;

    let mut plan = Plan::default();
    plan.tree(store, root, target.to_path_buf(), &mut Vec::new())?;

    for dir in &plan.dirs {
        fs::create_dir(dir).with_path(dir)?;
    }

    let workers = store.worker_pool()?;
    let bytes: Vec<u64> = workers.install(|| {
        plan.files
            .par_iter()
            .map(|(path, id)| write_file(store, id, path))
            .collect::<Result<Vec<_>>>()
    })?;

    let stats = ExportStats {
        files: plan.files.len(),
        directories: plan.dirs.len(),
        bytes: bytes.iter().sum(),
    };
    info!(root = %root, target = %target.display(), files = stats.files, "exported tree");
    Ok(stats)
}

/// write one object's content to a new file
pub fn export_object(store: &Store, id: &ObjectId, target: &Path) -> Result<u64> {
    if target.exists() {
        return Err(Error::TargetNotEmpty(target.to_path_buf()));
    }
    write_file(store, id, target)
}

fn write_file(store: &Store, id: &ObjectId, path: &Path) -> Result<u64> {
    let mut reader = store.get(id)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                Error::TargetNotEmpty(path.to_path_buf())
            } else {
                Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
    let written = io::copy(&mut reader, &mut file).with_path(path)?;
    if written != reader.size() {
        return Err(Error::CorruptObjectMessage(format!(
            "{}: expected {} bytes, decoded {}",
            id,
            reader.size(),
            written
        )));
    }
    Ok(written)
}

#[derive(Default)]
struct Plan {
    dirs: Vec<PathBuf>,
    files: Vec<(PathBuf, ObjectId)>,
}

impl Plan {
    fn tree(
        &mut self,
        store: &Store,
        id: &ObjectId,
        dir: PathBuf,
        expanding: &mut Vec<ManifestKey>,
    ) -> Result<()> {
        let tree = read_tree(store, id)?;
        for entry in tree.entries() {
            let path = dir.join(&entry.name);
            match entry.kind {
                EntryType::Blob => self.files.push((path, entry.id)),
                EntryType::Tree => {
                    self.dirs.push(path.clone());
                    self.tree(store, &entry.id, path, expanding)?;
                }
                EntryType::Manifest => {
                    let key = read_manifest_ref(store, &entry.id)?;
                    if expanding.contains(&key) {
                        return Err(Error::IllegalState(format!(
                            "manifest reference cycle through {} at {}",
                            key,
                            path.display()
                        )));
                    }
                    let root = *store.manifest(&key)?.root();
                    self.dirs.push(path.clone());
                    expanding.push(key);
                    self.tree(store, &root, path, expanding)?;
                    expanding.pop();
                }
            }
        }
        Ok(())
    }
}

/// fail with `TargetNotEmpty` unless `path` can receive an export
pub fn check_target(path: &Path) -> Result<()> {
    match fs::read_dir(path) {
        Ok(mut entries) => match entries.next() {
            Some(_) => Err(Error::TargetNotEmpty(path.to_path_buf())),
            None => Ok(()),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_path(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::import::import_tree;
    use crate::object::{write_manifest_ref, write_tree};
    use crate::types::{Manifest, TreeBuilder};
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::init(&dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_export_roundtrip() {
        let (dir, store) = test_store();
        let source = dir.path().join("source");
        fs::create_dir_all(source.join("b/deep")).unwrap();
        fs::write(source.join("a.txt"), "1").unwrap();
        fs::write(source.join("b/c.txt"), "2").unwrap();

        let txn = store.begin().unwrap();
        let root = import_tree(&store, &txn, &source).unwrap();
        txn.commit().unwrap();

        let target = dir.path().join("out");
        let stats = export_tree(&store, &root, &target).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 2);
        assert_eq!(fs::read_to_string(target.join("a.txt")).unwrap(), "1");
        assert_eq!(fs::read_to_string(target.join("b/c.txt")).unwrap(), "2");
        assert!(target.join("b/deep").is_dir());
    }

    #[test]
    fn test_export_refuses_non_empty_target() {
        let (dir, store) = test_store();
        let txn = store.begin().unwrap();
        let root = write_tree(&store, &txn, &TreeBuilder::new().build().unwrap()).unwrap();
        drop(txn);

        let target = dir.path().join("busy");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep"), "x").unwrap();
        assert!(matches!(
            export_tree(&store, &root, &target),
            Err(Error::TargetNotEmpty(_))
        ));
        assert!(check_target(&target).is_err());
        assert!(check_target(&dir.path().join("fresh")).is_ok());
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        assert!(check_target(&dir.path().join("empty")).is_ok());
    }

    #[test]
    fn test_export_expands_references() {
        let (dir, store) = test_store();
        let txn = store.begin().unwrap();
        let lib = store.put(&txn, b"lib").unwrap();
        let base = write_tree(&store, &txn, &TreeBuilder::new().blob("lib.so", lib).build().unwrap()).unwrap();
        let key = ManifestKey::parse("base:1").unwrap();
        store
            .insert_manifest(&txn, &Manifest::builder(key.clone()).root(base).build().unwrap())
            .unwrap();
        let link = write_manifest_ref(&store, &txn, &key).unwrap();
        let app = write_tree(&store, &txn, &TreeBuilder::new().manifest_ref("base", link).build().unwrap()).unwrap();
        txn.commit().unwrap();

        let target = dir.path().join("out");
        export_tree(&store, &app, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("base/lib.so")).unwrap(), "lib");
    }

    #[test]
    fn test_export_object() {
        let (dir, store) = test_store();
        let txn = store.begin().unwrap();
        let id = store.put(&txn, b"payload").unwrap();
        drop(txn);

        let target = dir.path().join("file");
        assert_eq!(export_object(&store, &id, &target).unwrap(), 7);
        assert!(matches!(
            export_object(&store, &id, &target),
            Err(Error::TargetNotEmpty(_))
        ));
    }
}
