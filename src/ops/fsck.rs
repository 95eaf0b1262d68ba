use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ErrorKind, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::object::{read_manifest_ref, read_tree};
use crate::store::Store;
use crate::txn::{TxnHandle, JOURNAL_SUFFIX};
use crate::types::{join_path, ManifestKey};

/// what is wrong with a broken element
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Problem {
    Missing,
    Corrupt,
    MissingManifest(ManifestKey),
    Unreadable(String),
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::Missing => write!(f, "missing"),
            Problem::Corrupt => write!(f, "corrupt"),
            Problem::MissingManifest(key) => write!(f, "missing manifest {}", key),
            Problem::Unreadable(why) => write!(f, "unreadable: {}", why),
        }
    }
}

/// one defect, attributed to the manifest whose closure contains it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenElement {
    pub manifest: ManifestKey,
    /// path below the manifest root, empty for the root itself
    pub path: String,
    pub id: Option<ObjectId>,
    pub problem: Problem,
}

impl fmt::Display for BrokenElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} /{}: {}", self.manifest, self.path, self.problem)?;
        if let Some(id) = &self.id {
            write!(f, " ({})", id)?;
        }
        Ok(())
    }
}

/// fsck report
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsckReport {
    pub manifests_checked: usize,
    /// distinct objects verified
    pub objects_checked: usize,
    pub broken: Vec<BrokenElement>,
    /// journals left by transactions that never finished
    pub interrupted_transactions: Vec<String>,
    pub repaired_manifests: Vec<ManifestKey>,
    pub removed_objects: Vec<ObjectId>,
}

impl FsckReport {
    pub fn is_ok(&self) -> bool {
        self.broken.is_empty() && self.interrupted_transactions.is_empty()
    }

    pub fn broken_manifests(&self) -> BTreeSet<ManifestKey> {
        self.broken.iter().map(|b| b.manifest.clone()).collect()
    }
}

/// check manifests (all of them when `keys` is empty) and optionally repair
///
/// runs under the caller's transaction, which keeps writers out.
pub fn fsck(
    store: &Store,
    txn: &TxnHandle,
    keys: &[ManifestKey],
    repair: bool,
) -> Result<FsckReport> {
    txn.check(store)?;

    let keys: Vec<ManifestKey> = if keys.is_empty() {
        store.list_manifests(None)?.into_iter().collect()
    } else {
        keys.to_vec()
    };

    let mut checker = Checker {
        store,
        health: HashMap::new(),
        broken: Vec::new(),
    };
    for key in &keys {
        checker.manifest(key)?;
    }

    let mut report = FsckReport {
        manifests_checked: keys.len(),
        objects_checked: checker.health.len(),
        broken: checker.broken,
        interrupted_transactions: store
            .journals()?
            .into_iter()
            .filter(|id| id != txn.id())
            .collect(),
        ..Default::default()
    };
    report
        .broken
        .sort_by(|a, b| (&a.manifest, &a.path).cmp(&(&b.manifest, &b.path)));

    if repair {
        let corrupt: Vec<ObjectId> = checker
            .health
            .iter()
            .filter(|(_, h)| **h == Health::Corrupt)
            .map(|(id, _)| *id)
            .collect();
        repair_store(store, txn, &mut report, &corrupt)?;
    }

    info!(
        manifests = report.manifests_checked,
        objects = report.objects_checked,
        broken = report.broken.len(),
        "fsck finished"
    );
    Ok(report)
}

fn repair_store(
    store: &Store,
    txn: &TxnHandle,
    report: &mut FsckReport,
    corrupt: &[ObjectId],
) -> Result<()> {
    for key in report.broken_manifests() {
        if store.has_manifest(&key) {
            warn!(manifest = %key, "deleting broken manifest");
            store.delete_manifest(txn, &key)?;
            report.repaired_manifests.push(key);
        }
    }

    // drop corrupt files so a later import rewrites them
    for id in corrupt {
        let mut removed = false;
        if store.local_objects().contains(id) {
            store.local_objects().remove(id)?;
            removed = true;
        }
        if let Some(pool) = store.pool_objects() {
            if pool.contains(id) {
                pool.remove(id)?;
                removed = true;
            }
        }
        if removed {
            warn!(object = %id, "removed corrupt object");
            report.removed_objects.push(*id);
        }
    }
    report.removed_objects.sort();

    for id in &report.interrupted_transactions {
        let journal = store.txn_path().join(format!("{}{}", id, JOURNAL_SUFFIX));
        match fs::remove_file(&journal) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(e).with_path(&journal)
            }
            _ => {}
        }
    }

    // staging files of crashed writers; the transaction keeps live ones out
    let tmp = store.tmp_path();
    for entry in fs::read_dir(&tmp).with_path(&tmp)? {
        let path = entry.with_path(&tmp)?.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.with_path(&path)?;
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Health {
    Ok,
    Missing,
    Corrupt,
}

struct Checker<'a> {
    store: &'a Store,
    /// each object is verified once per run
    health: HashMap<ObjectId, Health>,
    broken: Vec<BrokenElement>,
}

impl Checker<'_> {
    fn health(&mut self, id: &ObjectId) -> Result<Health> {
        if let Some(h) = self.health.get(id) {
            return Ok(*h);
        }
        let h = match self.store.verify(id) {
            Ok(true) => Health::Ok,
            Ok(false) => Health::Corrupt,
            Err(e) if e.kind() == ErrorKind::NotFound => Health::Missing,
            Err(e) => return Err(e),
        };
        self.health.insert(*id, h);
        Ok(h)
    }

    fn report(&mut self, owner: &ManifestKey, path: &str, id: Option<ObjectId>, problem: Problem) {
        self.broken.push(BrokenElement {
            manifest: owner.clone(),
            path: path.to_string(),
            id,
            problem,
        });
    }

    /// false (and reported) unless the object is present and intact
    fn sound(&mut self, owner: &ManifestKey, path: &str, id: &ObjectId) -> Result<bool> {
        match self.health(id)? {
            Health::Ok => Ok(true),
            Health::Missing => {
                self.report(owner, path, Some(*id), Problem::Missing);
                Ok(false)
            }
            Health::Corrupt => {
                self.report(owner, path, Some(*id), Problem::Corrupt);
                Ok(false)
            }
        }
    }

    fn manifest(&mut self, key: &ManifestKey) -> Result<()> {
        let manifest = match self.store.load_manifest(key) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                self.report(key, "", None, Problem::MissingManifest(key.clone()));
                return Ok(());
            }
            Err(e) if e.kind() != ErrorKind::Io => {
                self.report(key, "", None, Problem::Unreadable(e.to_string()));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut visiting = HashSet::from([key.clone()]);
        self.tree(key, "", manifest.root(), &mut visiting)
    }

    fn tree(
        &mut self,
        owner: &ManifestKey,
        path: &str,
        id: &ObjectId,
        visiting: &mut HashSet<ManifestKey>,
    ) -> Result<()> {
        if !self.sound(owner, path, id)? {
            return Ok(());
        }
        let tree = match read_tree(self.store, id) {
            Ok(tree) => tree,
            Err(e) if e.kind() != ErrorKind::Io => {
                self.report(owner, path, Some(*id), Problem::Unreadable(e.to_string()));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for entry in tree.entries() {
            let child = join_path(path, &entry.name);
            match entry.kind {
                crate::types::EntryType::Blob => {
                    self.sound(owner, &child, &entry.id)?;
                }
                crate::types::EntryType::Tree => self.tree(owner, &child, &entry.id, visiting)?,
                crate::types::EntryType::Manifest => {
                    self.reference(owner, &child, &entry.id, visiting)?
                }
            }
        }
        Ok(())
    }

    fn reference(
        &mut self,
        owner: &ManifestKey,
        path: &str,
        id: &ObjectId,
        visiting: &mut HashSet<ManifestKey>,
    ) -> Result<()> {
        if !self.sound(owner, path, id)? {
            return Ok(());
        }
        let key = match read_manifest_ref(self.store, id) {
            Ok(key) => key,
            Err(e) if e.kind() != ErrorKind::Io => {
                self.report(owner, path, Some(*id), Problem::Unreadable(e.to_string()));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if visiting.contains(&key) {
            return Ok(());
        }
        match self.store.load_manifest(&key)? {
            None => self.report(owner, path, Some(*id), Problem::MissingManifest(key)),
            Some(target) => {
                visiting.insert(key.clone());
                self.tree(owner, path, target.root(), visiting)?;
                visiting.remove(&key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{write_manifest_ref, write_tree};
    use crate::types::{Manifest, TreeBuilder};
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::init(&dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn key(s: &str) -> ManifestKey {
        ManifestKey::parse(s).unwrap()
    }

    /// two manifests sharing the blob "shared"
    fn populate(store: &Store) -> (ObjectId, ObjectId) {
        let txn = store.begin().unwrap();
        let shared = store.put(&txn, b"shared").unwrap();
        let own = store.put(&txn, b"own").unwrap();
        let one = write_tree(store, &txn, &TreeBuilder::new().blob("s", shared).build().unwrap()).unwrap();
        let two = write_tree(
            store,
            &txn,
            &TreeBuilder::new().blob("s", shared).blob("o", own).build().unwrap(),
        )
        .unwrap();
        for (k, root) in [("one:1", one), ("two:1", two)] {
            store
                .insert_manifest(&txn, &Manifest::builder(key(k)).root(root).build().unwrap())
                .unwrap();
        }
        txn.commit().unwrap();
        (shared, own)
    }

    #[test]
    fn test_clean_store() {
        let (_dir, store) = test_store();
        populate(&store);
        let txn = store.begin().unwrap();
        let report = fsck(&store, &txn, &[], false).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.manifests_checked, 2);
        // two trees, two blobs
        assert_eq!(report.objects_checked, 4);
    }

    #[test]
    fn test_shared_missing_blob_breaks_both() {
        let (_dir, store) = test_store();
        let (shared, _) = populate(&store);
        store.local_objects().remove(&shared).unwrap();

        let txn = store.begin().unwrap();
        let report = fsck(&store, &txn, &[], false).unwrap();
        assert_eq!(report.broken.len(), 2);
        assert!(report
            .broken
            .iter()
            .all(|b| b.problem == Problem::Missing && b.path == "s" && b.id == Some(shared)));
        assert_eq!(report.broken_manifests().len(), 2);
    }

    #[test]
    fn test_repair_then_clean() {
        let (_dir, store) = test_store();
        let (_, own) = populate(&store);
        let other = store.local_objects().path_of(&ObjectId::of(b"shared"));
        // corrupt "own" by replacing it with another valid object file
        fs::copy(&other, store.local_objects().path_of(&own)).unwrap();

        let txn = store.begin().unwrap();
        let report = fsck(&store, &txn, &[], true).unwrap();
        assert_eq!(report.repaired_manifests, vec![key("two:1")]);
        assert_eq!(report.removed_objects, vec![own]);
        assert!(!store.local_objects().contains(&own));
        assert!(store.has_manifest(&key("one:1")));

        let again = fsck(&store, &txn, &[], false).unwrap();
        assert!(again.is_ok());
        assert_eq!(again.manifests_checked, 1);
    }

    #[test]
    fn test_fsck_is_idempotent() {
        let (_dir, store) = test_store();
        let (shared, _) = populate(&store);
        store.local_objects().remove(&shared).unwrap();

        let txn = store.begin().unwrap();
        let first = fsck(&store, &txn, &[], false).unwrap();
        let second = fsck(&store, &txn, &[], false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_referenced_manifest() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        let dangling = write_manifest_ref(&store, &txn, &key("gone:1")).unwrap();
        let root = write_tree(&store, &txn, &TreeBuilder::new().manifest_ref("dep", dangling).build().unwrap()).unwrap();
        store
            .insert_manifest(&txn, &Manifest::builder(key("app:1")).root(root).build().unwrap())
            .unwrap();

        let report = fsck(&store, &txn, &[key("app:1")], false).unwrap();
        assert_eq!(report.broken.len(), 1);
        assert_eq!(report.broken[0].problem, Problem::MissingManifest(key("gone:1")));
        assert_eq!(report.broken[0].path, "dep");
    }

    #[test]
    fn test_interrupted_transaction_reported_and_cleared() {
        let (_dir, store) = test_store();
        fs::write(store.txn_path().join(format!("dead{}", JOURNAL_SUFFIX)), "txn dead").unwrap();
        fs::write(store.tmp_path().join("half-written"), "x").unwrap();

        let txn = store.begin().unwrap();
        let report = fsck(&store, &txn, &[], false).unwrap();
        assert_eq!(report.interrupted_transactions, vec!["dead".to_string()]);
        assert!(!report.is_ok());

        fsck(&store, &txn, &[], true).unwrap();
        let report = fsck(&store, &txn, &[], false).unwrap();
        assert!(report.is_ok());
        assert_eq!(fs::read_dir(store.tmp_path()).unwrap().count(), 0);
    }
}
