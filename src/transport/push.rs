//! push manifests to a remote

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::ops::{call, closure, MissingObjects, ObjectListing};
use crate::store::Store;
use crate::transport::archive::{pack_to_file, ArchiveRequest};
use crate::transport::Remote;
use crate::types::ManifestKey;

/// what a push or fetch moved, or would move on a dry run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub manifests_requested: usize,
    pub trees_in_closure: usize,
    pub trees_transferred: usize,
    pub blobs_in_closure: usize,
    pub blobs_transferred: usize,
    /// archive bytes sent, or object bytes a dry run would send
    pub bytes_transferred: u64,
    pub dry_run: bool,
}

impl TransferReport {
    pub(crate) fn new(
        keys: &[ManifestKey],
        listing: &ObjectListing,
        missing: &BTreeSet<ObjectId>,
        dry_run: bool,
    ) -> Self {
        TransferReport {
            manifests_requested: keys.len(),
            trees_in_closure: listing.trees.len(),
            trees_transferred: listing.trees.intersection(missing).count(),
            blobs_in_closure: listing.blobs.len(),
            blobs_transferred: listing.blobs.intersection(missing).count(),
            bytes_transferred: 0,
            dry_run,
        }
    }

    pub fn reused_trees(&self) -> usize {
        self.trees_in_closure - self.trees_transferred
    }

    pub fn reused_blobs(&self) -> usize {
        self.blobs_in_closure - self.blobs_transferred
    }
}

/// send `keys` and everything they reach that `remote` lacks
pub fn push(
    store: &Store,
    remote: &dyn Remote,
    keys: &[ManifestKey],
    dry_run: bool,
) -> Result<TransferReport> {
    if keys.is_empty() {
        return Err(Error::MissingParameter("keys"));
    }

    let listing = closure(store, keys)?;
    let missing: BTreeSet<ObjectId> =
        call(remote, MissingObjects::new(listing.objects().copied()))?
            .into_iter()
            .collect();
    let mut report = TransferReport::new(keys, &listing, &missing, dry_run);

    if dry_run {
        for id in &missing {
            report.bytes_transferred += store.size(id)?;
        }
        return Ok(report);
    }

    let request = ArchiveRequest {
        manifests: listing.manifests.iter().cloned().collect(),
        objects: missing.into_iter().collect(),
    };
    let staging = tempfile::NamedTempFile::new().with_path(std::env::temp_dir())?;
    report.bytes_transferred = pack_to_file(store, &request, staging.path())?;
    let summary = remote.upload(staging.path())?;

    info!(
        manifests = report.manifests_requested,
        trees = report.trees_transferred,
        blobs = report.blobs_transferred,
        bytes = report.bytes_transferred,
        inserted = summary.manifests_inserted.len(),
        "push complete"
    );
    Ok(report)
}
