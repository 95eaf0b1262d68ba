//! store-to-store transfer on one machine

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::object::CopyMode;
use crate::ops::{closure, Executor, Operation, Outcome};
use crate::store::Store;
use crate::transport::archive::{
    pack_to_file, plan_manifests, publish, unpack_into, ArchiveRequest, ImportSummary,
};
use crate::transport::Remote;
use crate::txn::TxnHandle;
use crate::types::ManifestKey;

/// transfer statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub copied: usize,
    pub hardlinked: usize,
    pub skipped: usize,
    pub bytes_transferred: u64,
    pub manifests_inserted: Vec<ManifestKey>,
    pub manifests_skipped: Vec<ManifestKey>,
}

/// copy object files from `src` into `dst`, hard-linking where possible
pub fn copy_objects<'a>(
    src: &Store,
    dst: &Store,
    txn: &TxnHandle,
    ids: impl IntoIterator<Item = &'a ObjectId>,
) -> Result<TransferStats> {
    let mut stats = TransferStats::default();
    for id in ids {
        if dst.exists(id) {
            stats.skipped += 1;
            continue;
        }
        let db = src.locate(id).ok_or(Error::ObjectNotFound(*id))?;
        match dst.adopt(txn, &db, id)? {
            CopyMode::Hardlinked => stats.hardlinked += 1,
            CopyMode::Copied => {
                stats.copied += 1;
                stats.bytes_transferred += db.disk_size(id)?;
            }
            CopyMode::Skipped => stats.skipped += 1,
        }
    }
    Ok(stats)
}

/// copy manifests and their closures from `src` into `dst`
///
/// objects first, then manifests with referenced ones ahead of their users.
pub fn copy_manifests(
    src: &Store,
    dst: &Store,
    txn: &TxnHandle,
    keys: &[ManifestKey],
) -> Result<TransferStats> {
    txn.check(dst)?;
    if keys.is_empty() {
        return Err(Error::MissingParameter("keys"));
    }

    let mut order = Vec::new();
    for key in keys {
        let listing = closure(src, std::slice::from_ref(key))?;
        for referenced in listing.manifests.iter() {
            let depth = closure(src, std::slice::from_ref(referenced))?.manifests.len();
            order.push((depth, referenced.clone()));
        }
    }
    order.sort();
    let plan = plan_manifests(src, dst, order.into_iter().map(|(_, key)| key))?;

    let listing = closure(src, keys)?;
    let mut stats = copy_objects(src, dst, txn, listing.objects())?;

    let mut summary = ImportSummary::default();
    publish(dst, txn, plan, &mut summary)?;
    stats.manifests_inserted = summary.manifests_inserted;
    stats.manifests_skipped = summary.manifests_skipped;

    info!(
        from = %src.path().display(),
        to = %dst.path().display(),
        copied = stats.copied,
        hardlinked = stats.hardlinked,
        skipped = stats.skipped,
        "copied manifests"
    );
    Ok(stats)
}

/// another store on this machine, reached through the filesystem
pub struct LocalRemote {
    store: Store,
}

impl LocalRemote {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            store: Store::open(path)?,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

impl Executor for LocalRemote {
    fn execute(&self, op: Operation) -> Result<Outcome> {
        self.store.execute(op)
    }
}

impl Remote for LocalRemote {
    fn upload(&self, archive: &Path) -> Result<ImportSummary> {
        let file = File::open(archive).with_path(archive)?;
        let txn = self.store.begin()?;
        let summary = unpack_into(&self.store, &txn, file)?;
        txn.commit()?;
        Ok(summary)
    }

    fn download(&self, request: &ArchiveRequest, dest: &Path) -> Result<u64> {
        pack_to_file(&self.store, request, dest)
    }
}
