//! fetch manifests from a remote

use std::collections::BTreeSet;
use std::fs::File;

use tracing::info;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::ops::{call, ListClosure, ObjectSizes};
use crate::store::Store;
use crate::transport::archive::{unpack_into, ArchiveRequest};
use crate::transport::{Remote, TransferReport};
use crate::txn::TxnHandle;
use crate::types::ManifestKey;

/// bring `keys` and everything they reach over from `remote`
pub fn fetch(
    store: &Store,
    txn: &TxnHandle,
    remote: &dyn Remote,
    keys: &[ManifestKey],
    dry_run: bool,
) -> Result<TransferReport> {
    txn.check(store)?;
    if keys.is_empty() {
        return Err(Error::MissingParameter("keys"));
    }

    let listing = call(remote, ListClosure::new(keys.iter().cloned()))?;
    let missing: BTreeSet<ObjectId> = listing
        .objects()
        .filter(|id| !store.exists(id))
        .copied()
        .collect();
    let mut report = TransferReport::new(keys, &listing, &missing, dry_run);

    if dry_run {
        let sizes = call(remote, ObjectSizes::new(missing.iter().copied()))?;
        report.bytes_transferred = sizes.values().sum();
        return Ok(report);
    }

    let request = ArchiveRequest {
        manifests: listing.manifests.iter().cloned().collect(),
        objects: missing.into_iter().collect(),
    };
    let staging = tempfile::NamedTempFile::new().with_path(std::env::temp_dir())?;
    report.bytes_transferred = remote.download(&request, staging.path())?;
    let archive = File::open(staging.path()).with_path(staging.path())?;
    let summary = unpack_into(store, txn, archive)?;

    info!(
        manifests = report.manifests_requested,
        trees = report.trees_transferred,
        blobs = report.blobs_transferred,
        bytes = report.bytes_transferred,
        inserted = summary.manifests_inserted.len(),
        "fetch complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{write_manifest_ref, write_tree};
    use crate::transport::LocalRemote;
    use crate::types::{Manifest, TreeBuilder};
    use tempfile::tempdir;

    fn key(s: &str) -> ManifestKey {
        ManifestKey::parse(s).unwrap()
    }

    #[test]
    fn test_fetch_with_references() {
        let dir = tempdir().unwrap();
        let remote_path = dir.path().join("remote");
        let origin = Store::init(&remote_path).unwrap();
        {
            let txn = origin.begin().unwrap();
            let lib = origin.put(&txn, b"lib").unwrap();
            let base = write_tree(&origin, &txn, &TreeBuilder::new().blob("lib", lib).build().unwrap()).unwrap();
            origin
                .insert_manifest(&txn, &Manifest::builder(key("base:1")).root(base).build().unwrap())
                .unwrap();
            let link = write_manifest_ref(&origin, &txn, &key("base:1")).unwrap();
            let app = write_tree(&origin, &txn, &TreeBuilder::new().manifest_ref("base", link).build().unwrap()).unwrap();
            origin
                .insert_manifest(&txn, &Manifest::builder(key("app:1")).root(app).build().unwrap())
                .unwrap();
            txn.commit().unwrap();
        }
        drop(origin);

        let local = Store::init(&dir.path().join("local")).unwrap();
        let remote = LocalRemote::open(&remote_path).unwrap();
        let txn = local.begin().unwrap();

        let dry = fetch(&local, &txn, &remote, &[key("app:1")], true).unwrap();
        assert_eq!(dry.trees_transferred, 2);
        assert_eq!(dry.blobs_transferred, 2);
        assert!(!local.has_manifest(&key("app:1")));

        let report = fetch(&local, &txn, &remote, &[key("app:1")], false).unwrap();
        assert_eq!(report.manifests_requested, 1);
        assert!(report.bytes_transferred > 0);
        assert!(local.has_manifest(&key("app:1")));
        assert!(local.has_manifest(&key("base:1")));
        assert_eq!(local.read(&ObjectId::of(b"lib")).unwrap(), b"lib");

        let again = fetch(&local, &txn, &remote, &[key("app:1")], false).unwrap();
        assert_eq!(again.reused_trees(), 2);
        assert_eq!(again.reused_blobs(), 2);
    }

    #[test]
    fn test_fetch_unknown_manifest() {
        let dir = tempdir().unwrap();
        Store::init(&dir.path().join("remote")).unwrap();
        let local = Store::init(&dir.path().join("local")).unwrap();
        let remote = LocalRemote::open(&dir.path().join("remote")).unwrap();
        let txn = local.begin().unwrap();
        let err = fetch(&local, &txn, &remote, &[key("nope:1")], false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
