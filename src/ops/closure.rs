use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::{decode_manifest_ref, decode_tree};
use crate::store::Store;
use crate::types::{EntryType, Manifest, ManifestKey};

/// somewhere objects and manifests can be read from
pub trait ObjectSource {
    fn read_object(&self, id: &ObjectId) -> Result<Vec<u8>>;
    fn has_object(&self, id: &ObjectId) -> bool;
    fn find_manifest(&self, key: &ManifestKey) -> Result<Option<Manifest>>;
}

impl ObjectSource for Store {
    fn read_object(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.read(id)
    }

    fn has_object(&self, id: &ObjectId) -> bool {
        self.exists(id)
    }

    fn find_manifest(&self, key: &ManifestKey) -> Result<Option<Manifest>> {
        self.load_manifest(key)
    }
}

/// two stores seen as one, `upper` taking precedence
pub struct Overlay<'a> {
    pub upper: &'a Store,
    pub lower: &'a Store,
}

impl ObjectSource for Overlay<'_> {
    fn read_object(&self, id: &ObjectId) -> Result<Vec<u8>> {
        if self.upper.exists(id) {
            self.upper.read(id)
        } else {
            self.lower.read(id)
        }
    }

    fn has_object(&self, id: &ObjectId) -> bool {
        self.upper.exists(id) || self.lower.exists(id)
    }

    fn find_manifest(&self, key: &ManifestKey) -> Result<Option<Manifest>> {
        match self.upper.load_manifest(key)? {
            Some(manifest) => Ok(Some(manifest)),
            None => self.lower.load_manifest(key),
        }
    }
}

/// everything reachable from a set of manifests
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectListing {
    /// requested manifests plus every manifest they reference
    pub manifests: BTreeSet<ManifestKey>,
    pub trees: BTreeSet<ObjectId>,
    /// content objects, including manifest reference objects
    pub blobs: BTreeSet<ObjectId>,
}

impl ObjectListing {
    pub fn objects(&self) -> impl Iterator<Item = &ObjectId> {
        self.trees.iter().chain(self.blobs.iter())
    }

    pub fn object_count(&self) -> usize {
        self.trees.len() + self.blobs.len()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.trees.contains(id) || self.blobs.contains(id)
    }

    pub fn merge(&mut self, other: ObjectListing) {
        self.manifests.extend(other.manifests);
        self.trees.extend(other.trees);
        self.blobs.extend(other.blobs);
    }
}

/// walk the closure of `keys`; anything unresolvable is an error
pub fn closure<S: ObjectSource + ?Sized>(source: &S, keys: &[ManifestKey]) -> Result<ObjectListing> {
    walk_manifests(source, keys, false)
}

/// walk the closure of `keys`, passing over missing objects and manifests
///
/// an object that cannot be read is still listed but not descended into.
/// corrupt objects remain errors.
pub fn partial_closure<S: ObjectSource + ?Sized>(
    source: &S,
    keys: &[ManifestKey],
) -> Result<ObjectListing> {
    walk_manifests(source, keys, true)
}

fn walk_manifests<S: ObjectSource + ?Sized>(
    source: &S,
    keys: &[ManifestKey],
    skip_missing: bool,
) -> Result<ObjectListing> {
    let mut walker = Walker {
        source,
        listing: ObjectListing::default(),
        skip_missing,
    };
    for key in keys {
        walker.visit_manifest(key)?;
    }
    Ok(walker.listing)
}

/// closure of a bare tree
pub fn tree_closure<S: ObjectSource + ?Sized>(source: &S, root: &ObjectId) -> Result<ObjectListing> {
    let mut walker = Walker {
        source,
        listing: ObjectListing::default(),
        skip_missing: false,
    };
    walker.visit_tree(*root)?;
    Ok(walker.listing)
}

struct Walker<'a, S: ?Sized> {
    source: &'a S,
    listing: ObjectListing,
    skip_missing: bool,
}

impl<S: ObjectSource + ?Sized> Walker<'_, S> {
    fn visit_manifest(&mut self, key: &ManifestKey) -> Result<()> {
        // the visited set also stops reference cycles
        if !self.listing.manifests.insert(key.clone()) {
            return Ok(());
        }
        match self.source.find_manifest(key)? {
            Some(manifest) => self.visit_tree(*manifest.root()),
            None if self.skip_missing => Ok(()),
            None => Err(Error::ManifestNotFound(key.clone())),
        }
    }

    /// `None` when the object is absent and the walk tolerates that
    fn read(&self, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        match self.source.read_object(id) {
            Ok(content) => Ok(Some(content)),
            Err(Error::ObjectNotFound(_)) if self.skip_missing => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn visit_tree(&mut self, id: ObjectId) -> Result<()> {
        if !self.listing.trees.insert(id) {
            return Ok(());
        }
        let Some(content) = self.read(&id)? else {
            return Ok(());
        };
        let tree = decode_tree(&id, &content)?;
        for entry in tree.entries() {
            match entry.kind {
                EntryType::Blob => {
                    self.listing.blobs.insert(entry.id);
                }
                EntryType::Tree => self.visit_tree(entry.id)?,
                EntryType::Manifest => {
                    self.listing.blobs.insert(entry.id);
                    if let Some(content) = self.read(&entry.id)? {
                        let key = decode_manifest_ref(&entry.id, &content)?;
                        self.visit_manifest(&key)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// uncompressed sizes of the given objects; absent ones are left out
pub fn object_sizes(store: &Store, ids: &[ObjectId]) -> Result<BTreeMap<ObjectId, u64>> {
    let mut sizes = BTreeMap::new();
    for id in ids {
        match store.size(id) {
            Ok(size) => {
                sizes.insert(*id, size);
            }
            Err(Error::ObjectNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(sizes)
}

/// the subset of `ids` this store does not hold
pub fn missing_objects(store: &Store, ids: &[ObjectId]) -> Vec<ObjectId> {
    let missing: BTreeSet<_> = ids.iter().filter(|id| !store.exists(id)).copied().collect();
    missing.into_iter().collect()
}

/// every manifest key with its root tree
pub fn inventory(store: &Store, prefix: Option<&str>) -> Result<BTreeMap<ManifestKey, ObjectId>> {
    let mut roots = BTreeMap::new();
    for key in store.list_manifests(prefix)? {
        // tolerate a delete racing with the listing
        if let Some(manifest) = store.load_manifest(&key)? {
            roots.insert(key, *manifest.root());
        }
    }
    Ok(roots)
}
