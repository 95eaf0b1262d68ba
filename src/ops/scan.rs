use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::{read_manifest_ref, read_tree};
use crate::store::Store;
use crate::types::{EntryType, ManifestKey, ScanRoot, TreeView};

/// scan settings
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanOptions {
    /// tree levels below the root to expand; `None` for unlimited
    pub max_depth: Option<usize>,
    /// expand manifest references into the referenced manifest's root
    pub follow_references: bool,
}

/// root tree id behind a scan root
pub fn resolve_root(store: &Store, root: &ScanRoot) -> Result<ObjectId> {
    match root {
        ScanRoot::Manifest(key) => Ok(*store.manifest(key)?.root()),
        ScanRoot::Tree(id) => Ok(*id),
    }
}

/// build an in-memory view of a tree
///
/// absent objects below the root show up as `Missing` nodes; a missing
/// root manifest is an error.
pub fn scan(store: &Store, root: &ScanRoot, options: ScanOptions) -> Result<TreeView> {
    let mut scanner = Scanner {
        store,
        options,
        active: HashSet::new(),
    };
    let root_id = match root {
        ScanRoot::Manifest(key) => {
            scanner.active.insert(key.clone());
            *store.manifest(key)?.root()
        }
        ScanRoot::Tree(id) => *id,
    };
    scanner.node(root_id, EntryType::Tree, 0)
}

struct Scanner<'a> {
    store: &'a Store,
    options: ScanOptions,
    /// manifests being expanded on the current path
    active: HashSet<ManifestKey>,
}

impl Scanner<'_> {
    fn node(&mut self, id: ObjectId, kind: EntryType, depth: usize) -> Result<TreeView> {
        if !self.store.exists(&id) {
            return Ok(TreeView::Missing { id, expected: kind });
        }
        match kind {
            EntryType::Blob => Ok(TreeView::Blob {
                id,
                size: self.store.size(&id)?,
            }),
            EntryType::Tree => self.tree(id, depth),
            EntryType::Manifest => self.reference(id, depth),
        }
    }

    fn tree(&mut self, id: ObjectId, depth: usize) -> Result<TreeView> {
        let mut children = BTreeMap::new();
        if self.options.max_depth.is_some_and(|max| depth >= max) {
            return Ok(TreeView::Tree {
                id,
                children,
                truncated: true,
            });
        }

        let tree = match read_tree(self.store, &id) {
            Ok(tree) => tree,
            Err(Error::ObjectNotFound(_)) => {
                return Ok(TreeView::Missing {
                    id,
                    expected: EntryType::Tree,
                })
            }
            Err(e) => return Err(e),
        };
        for entry in tree.entries() {
            let child = self.node(entry.id, entry.kind, depth + 1)?;
            children.insert(entry.name.clone(), child);
        }
        Ok(TreeView::Tree {
            id,
            children,
            truncated: false,
        })
    }

    fn reference(&mut self, id: ObjectId, depth: usize) -> Result<TreeView> {
        let key = read_manifest_ref(self.store, &id)?;
        let expanded = if self.options.follow_references && !self.active.contains(&key) {
            match self.store.load_manifest(&key)? {
                Some(manifest) => {
                    self.active.insert(key.clone());
                    let view = self.node(*manifest.root(), EntryType::Tree, depth);
                    self.active.remove(&key);
                    Some(Box::new(view?))
                }
                None => None,
            }
        } else {
            None
        };
        Ok(TreeView::ManifestRef { id, key, expanded })
    }
}
