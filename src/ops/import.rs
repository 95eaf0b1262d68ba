use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::object::{write_manifest_ref, write_tree};
use crate::store::Store;
use crate::txn::TxnHandle;
use crate::types::{EntryType, Manifest, ManifestKey, Tree, TreeEntry};

/// store a directory as a tree and publish it under `key`
///
/// the manifest is inserted only after every object below it is stored.
pub fn import_directory(
    store: &Store,
    txn: &TxnHandle,
    source: &Path,
    key: &ManifestKey,
    labels: &BTreeMap<String, String>,
) -> Result<Manifest> {
    if store.has_manifest(key) {
        return Err(Error::ManifestExists(key.clone()));
    }

    let root = import_tree(store, txn, source)?;
    let manifest = Manifest::builder(key.clone())
        .root(root)
        .labels(labels.clone())
        .build()?;
    store.insert_manifest(txn, &manifest)?;

    info!(manifest = %key, root = %root, source = %source.display(), "imported directory");
    Ok(manifest)
}

/// store a directory as a tree, returning the root tree id
pub fn import_tree(store: &Store, txn: &TxnHandle, source: &Path) -> Result<ObjectId> {
    let meta = fs::metadata(source).with_path(source)?;
    if !meta.is_dir() {
        return Err(Error::IllegalState(format!(
            "import source is not a directory: {}",
            source.display()
        )));
    }

    let mut dirs: BTreeMap<PathBuf, Vec<TreeEntry>> = BTreeMap::new();
    dirs.insert(PathBuf::new(), Vec::new());
    let mut files = Vec::new();

    for entry in WalkDir::new(source)
        .follow_links(true)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::Io {
            path: source.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walkdir error")),
        })?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| Error::PathNotFound(entry.path().display().to_string()))?
            .to_path_buf();

        let file_type = entry.file_type();
        if file_type.is_dir() {
            dirs.entry(rel).or_default();
        } else if file_type.is_file() {
            files.push((rel, entry.path().to_path_buf()));
        } else {
            warn!(path = %entry.path().display(), "skipping special file");
        }
    }

    // file contents go in parallel, trees are assembled afterwards
    let workers = store.worker_pool()?;
    let stored: Vec<(PathBuf, ObjectId)> = workers.install(|| {
        files
            .par_iter()
            .map(|(rel, path)| {
                let mut file = File::open(path).with_path(path)?;
                let id = store.put_streaming(txn, &mut file)?;
                Ok((rel.clone(), id))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    for (rel, id) in stored {
        let (parent, name) = split_entry(&rel)?;
        dirs.entry(parent)
            .or_default()
            .push(TreeEntry::new(name, EntryType::Blob, id));
    }

    // deepest directories first so children exist before their parents
    let mut order: Vec<PathBuf> = dirs.keys().cloned().collect();
    order.sort_by_key(|p| Reverse(p.components().count()));

    for dir in order {
        let entries = dirs.remove(&dir).unwrap_or_default();
        let id = write_tree(store, txn, &Tree::new(entries)?)?;
        if dir.as_os_str().is_empty() {
            return Ok(id);
        }
        let (parent, name) = split_entry(&dir)?;
        dirs.entry(parent)
            .or_default()
            .push(TreeEntry::new(name, EntryType::Tree, id));
    }

    // the root is always in `order`
    Err(Error::IllegalState("import produced no root tree".to_string()))
}

/// (parent, utf-8 file name) of a relative path
fn split_entry(rel: &Path) -> Result<(PathBuf, String)> {
    let name = rel
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidEntryName(rel.to_string_lossy().to_string()))?
        .to_string();
    let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((parent, name))
}

/// store a single file's content
pub fn import_file(store: &Store, txn: &TxnHandle, path: &Path) -> Result<ObjectId> {
    let mut file = File::open(path).with_path(path)?;
    store.put_streaming(txn, &mut file)
}

/// store a tree whose children are already present
pub fn insert_tree(store: &Store, txn: &TxnHandle, tree: &Tree) -> Result<ObjectId> {
    // trees arriving through an operation were deserialized, not built
    tree.validate()?;
    let mut missing = BTreeSet::new();
    for entry in tree.entries() {
        if !store.exists(&entry.id) {
            missing.insert(entry.id);
        }
    }
    if let Some(id) = missing.into_iter().next() {
        return Err(Error::ObjectNotFound(id));
    }
    write_tree(store, txn, tree)
}

/// store a reference object pointing at an existing manifest
pub fn insert_manifest_ref(store: &Store, txn: &TxnHandle, key: &ManifestKey) -> Result<ObjectId> {
    if !store.has_manifest(key) {
        return Err(Error::ManifestNotFound(key.clone()));
    }
    write_manifest_ref(store, txn, key)
}
