//! transfer archives
//!
//! an archive is a tar of a partial store holding only the objects the
//! receiver lacks plus the manifest records being transferred. receivers
//! verify every closure against archive and target together before any
//! manifest becomes visible.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::object::CopyMode;
use crate::ops::{closure, ObjectSource, Overlay};
use crate::store::Store;
use crate::txn::TxnHandle;
use crate::types::{Manifest, ManifestKey};

const ARCHIVE_ROOT: &str = "store";

/// what an archive should contain
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub manifests: Vec<ManifestKey>,
    pub objects: Vec<ObjectId>,
}

/// result of importing an archive
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub objects_imported: usize,
    pub manifests_inserted: Vec<ManifestKey>,
    /// already present with the same root
    pub manifests_skipped: Vec<ManifestKey>,
}

/// write the archive for `request` to `out`
pub fn pack<W: Write>(store: &Store, request: &ArchiveRequest, out: W) -> Result<W> {
    let staging = tempfile::tempdir().with_path(std::env::temp_dir())?;
    let partial_path = staging.path().join(ARCHIVE_ROOT);
    let partial = Store::init(&partial_path)?;

    {
        let txn = partial.begin()?;
        for id in &request.objects {
            let db = store.locate(id).ok_or(Error::ObjectNotFound(*id))?;
            partial.adopt(&txn, &db, id)?;
        }
        // roots may live on the receiving side only, so records go in unchecked
        for key in &request.manifests {
            partial.manifest_db().insert(&store.manifest(key)?)?;
        }
        txn.commit()?;
    }

    let mut builder = tar::Builder::new(out);
    builder
        .append_dir_all(ARCHIVE_ROOT, &partial_path)
        .with_path(&partial_path)?;
    let out = builder.into_inner().with_path(&partial_path)?;
    debug!(
        objects = request.objects.len(),
        manifests = request.manifests.len(),
        "packed archive"
    );
    Ok(out)
}

/// import an archive into `store`
///
/// all objects land before the first manifest; manifests go in referenced
/// ones first. an existing manifest with the same root is skipped, one with
/// a different root fails the import before anything is written.
pub fn unpack_into<R: Read>(store: &Store, txn: &TxnHandle, archive: R) -> Result<ImportSummary> {
    txn.check(store)?;
    let staging = tempfile::tempdir().with_path(std::env::temp_dir())?;
    tar::Archive::new(archive)
        .unpack(staging.path())
        .map_err(|e| Error::transport(format!("unreadable archive: {}", e)))?;
    let partial = Store::open(&staging.path().join(ARCHIVE_ROOT))?;

    // every shipped object must match its id
    let shipped = partial.local_objects().list()?;
    for id in &shipped {
        if !partial.local_objects().verify(id)? {
            return Err(Error::CorruptObject(*id));
        }
    }

    let keys: Vec<ManifestKey> = partial.list_manifests(None)?.into_iter().collect();
    let overlay = Overlay {
        upper: &partial,
        lower: store,
    };
    let mut order = Vec::with_capacity(keys.len());
    for key in &keys {
        let listing = closure(&overlay, std::slice::from_ref(key))?;
        if let Some(id) = listing.objects().find(|id| !overlay.has_object(id)) {
            return Err(Error::ObjectNotFound(*id));
        }
        order.push((listing.manifests.len(), key.clone()));
    }
    order.sort();

    let plan = plan_manifests(&partial, store, order.into_iter().map(|(_, key)| key))?;

    let mut summary = ImportSummary::default();
    for id in &shipped {
        if store.adopt(txn, partial.local_objects(), id)? != CopyMode::Skipped {
            summary.objects_imported += 1;
        }
    }
    publish(store, txn, plan, &mut summary)?;

    info!(
        objects = summary.objects_imported,
        inserted = summary.manifests_inserted.len(),
        skipped = summary.manifests_skipped.len(),
        "imported archive"
    );
    Ok(summary)
}

/// a manifest to insert, or one already present with the same root
pub(crate) enum Planned {
    Insert(Manifest),
    Present(ManifestKey),
}

/// decide per manifest, failing on the first conflicting root
pub(crate) fn plan_manifests<S: ObjectSource + ?Sized>(
    source: &S,
    target: &Store,
    keys: impl IntoIterator<Item = ManifestKey>,
) -> Result<Vec<Planned>> {
    let mut plan = Vec::new();
    let mut seen = BTreeSet::new();
    for key in keys {
        if !seen.insert(key.clone()) {
            continue;
        }
        let manifest = source
            .find_manifest(&key)?
            .ok_or_else(|| Error::ManifestNotFound(key.clone()))?;
        match target.load_manifest(&key)? {
            Some(existing) if existing.root() == manifest.root() => plan.push(Planned::Present(key)),
            Some(_) => return Err(Error::ManifestExists(key)),
            None => plan.push(Planned::Insert(manifest)),
        }
    }
    Ok(plan)
}

pub(crate) fn publish(
    store: &Store,
    txn: &TxnHandle,
    plan: Vec<Planned>,
    summary: &mut ImportSummary,
) -> Result<()> {
    for planned in plan {
        match planned {
            Planned::Insert(manifest) => {
                store.insert_manifest(txn, &manifest)?;
                summary.manifests_inserted.push(manifest.key().clone());
            }
            Planned::Present(key) => summary.manifests_skipped.push(key),
        }
    }
    Ok(())
}

/// archive bytes written to `path`
pub(crate) fn pack_to_file(store: &Store, request: &ArchiveRequest, path: &Path) -> Result<u64> {
    let file = std::fs::File::create(path).with_path(path)?;
    let file = pack(store, request, file)?;
    file.sync_all().with_path(path)?;
    Ok(file.metadata().with_path(path)?.len())
}
