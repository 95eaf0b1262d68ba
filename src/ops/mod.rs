//! high-level operations on hive stores

mod closure;
mod diff;
mod export;
mod fsck;
mod import;
mod operation;
mod prune;
mod scan;
mod usage;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

pub use closure::{
    closure, inventory, missing_objects, object_sizes, partial_closure, tree_closure,
    ObjectListing, ObjectSource, Overlay,
};
pub use diff::{diff, diff_trees, estimate_transfer, TransferEstimate};
pub use export::{check_target, export_object, export_tree, ExportStats};
pub use fsck::{fsck, BrokenElement, FsckReport, Problem};
pub use import::{import_directory, import_file, import_tree, insert_manifest_ref, insert_tree};
pub use operation::*;
pub use prune::{prune, PruneReport};
pub use scan::{resolve_root, scan, ScanOptions};
pub use usage::{disc_usage, UsageCache, UsageEntry, UsageReport};

use crate::error::Result;
use crate::pool::{self, PoolReport};
use crate::store::Store;
use crate::transport;
use crate::txn::TxnHandle;

impl Executor for Store {
    /// run an operation; writes get a transaction of their own
    fn execute(&self, op: Operation) -> Result<Outcome> {
        execute_in(self, None, op)
    }
}

/// run `op` against `store`, writing through `txn` when one is given
pub(crate) fn execute_in(store: &Store, txn: Option<&TxnHandle>, op: Operation) -> Result<Outcome> {
    debug!(op = op.name(), store = %store.path().display(), "executing operation");
    let outcome = match op {
        Operation::ListManifests(r) => Outcome::Manifests(store.list_manifests(r.prefix.as_deref())?),
        Operation::LoadManifest(r) => Outcome::Manifest(store.load_manifest(&r.key)?),
        Operation::InsertManifest(r) => {
            with_txn(store, txn, |t| store.insert_manifest(t, &r.manifest))?;
            Outcome::Unit
        }
        Operation::DeleteManifest(r) => {
            with_txn(store, txn, |t| store.delete_manifest(t, &r.key))?;
            Outcome::Unit
        }
        Operation::DeleteOldManifests(r) => Outcome::Keys(with_txn(store, txn, |t| {
            store.delete_old_manifests(t, &r.name, r.keep)
        })?),
        Operation::NextTag(r) => Outcome::Tag(store.next_tag(&r.name)?),
        Operation::MaxTag(r) => Outcome::MaxTag(store.max_tag(&r.name)?),

        Operation::ImportObject(r) => {
            Outcome::Object(with_txn(store, txn, |t| store.put(t, &r.bytes))?)
        }
        Operation::ImportFile(r) => {
            Outcome::Object(with_txn(store, txn, |t| import_file(store, t, &r.path))?)
        }
        Operation::ImportDirectory(r) => Outcome::Imported(with_txn(store, txn, |t| {
            import_directory(store, t, &r.source, &r.key, &r.labels)
        })?),
        Operation::ExportObject(r) => Outcome::Bytes(export_object(store, &r.id, &r.target)?),
        Operation::ExportTree(r) => {
            let root = resolve_root(store, &r.root)?;
            Outcome::Export(export_tree(store, &root, &r.target)?)
        }
        Operation::InsertTree(r) => {
            Outcome::Object(with_txn(store, txn, |t| insert_tree(store, t, &r.tree))?)
        }
        Operation::InsertManifestRef(r) => {
            Outcome::Object(with_txn(store, txn, |t| insert_manifest_ref(store, t, &r.key))?)
        }

        Operation::ListClosure(r) => Outcome::Listing(closure(store, &r.keys)?),
        Operation::ObjectSizes(r) => Outcome::Sizes(object_sizes(store, &r.ids)?),
        Operation::MissingObjects(r) => Outcome::Objects(missing_objects(store, &r.ids)),
        Operation::Inventory(r) => Outcome::Inventory(inventory(store, r.prefix.as_deref())?),
        Operation::ScanTree(r) => {
            let options = ScanOptions {
                max_depth: r.max_depth,
                follow_references: r.follow_references,
            };
            Outcome::View(scan(store, &r.root, options)?)
        }
        Operation::DiffTrees(r) => {
            Outcome::Diff(diff_trees(store, &r.left, &r.right, r.follow_references)?)
        }
        Operation::EstimateTransfer(r) => {
            Outcome::Estimate(estimate_transfer(store, r.from.as_ref(), &r.to)?)
        }
        Operation::DiscUsage(r) => {
            let cache = store.usage_cache();
            if r.fresh {
                cache.invalidate(r.prefix.as_deref());
            }
            Outcome::Usage(cache.report(store, r.prefix.as_deref())?)
        }
        Operation::CancelDiscUsage(r) => {
            Outcome::Flag(store.usage_cache().cancel(r.prefix.as_deref()))
        }

        Operation::Fsck(r) => {
            Outcome::Fsck(with_txn(store, txn, |t| fsck(store, t, &r.keys, r.repair))?)
        }
        Operation::Prune(r) => Outcome::Prune(with_txn(store, txn, |t| prune(store, t, r.dry_run))?),

        Operation::CopyManifests(r) => {
            let target = Store::open(&r.target)?;
            let target_txn = target.begin()?;
            let stats = transport::copy_manifests(store, &target, &target_txn, &r.keys)?;
            target_txn.commit()?;
            Outcome::Copied(stats)
        }
        Operation::Push(r) => {
            let remote = transport::open_remote(&remote_url(store, &r.remote))?;
            Outcome::Transfer(transport::push(store, remote.as_ref(), &r.keys, r.dry_run)?)
        }
        Operation::Fetch(r) => {
            let remote = transport::open_remote(&remote_url(store, &r.remote))?;
            Outcome::Transfer(with_txn(store, txn, |t| {
                transport::fetch(store, t, remote.as_ref(), &r.keys, r.dry_run)
            })?)
        }

        Operation::EnablePooling(r) => {
            with_txn(store, txn, |t| pool::enable_pooling(store, t, &r.pool, r.force))?;
            Outcome::Unit
        }
        Operation::DisablePooling(_) => {
            Outcome::Count(with_txn(store, txn, |t| pool::disable_pooling(store, t))?)
        }
        Operation::ReorganizePool(r) => {
            Outcome::Pool(reorganize_pool(store, txn, &r.stores, r.usage_threshold)?)
        }
    };
    Ok(outcome)
}

/// run `f` in the caller's transaction, or in a fresh one committed after
fn with_txn<T>(
    store: &Store,
    txn: Option<&TxnHandle>,
    f: impl FnOnce(&TxnHandle) -> Result<T>,
) -> Result<T> {
    match txn {
        Some(txn) => f(txn),
        None => {
            let txn = store.begin()?;
            let value = f(&txn)?;
            txn.commit()?;
            Ok(value)
        }
    }
}

/// configured remote name to url; anything else is taken as a url
fn remote_url(store: &Store, remote: &str) -> String {
    store
        .config()
        .get_remote(remote)
        .map(|r| r.url.clone())
        .unwrap_or_else(|| remote.to_string())
}

/// lock every participant of a reorganization and run it
///
/// without a caller transaction all stores, the executing one included, are
/// locked in canonical path order. a caller transaction already holds the
/// executing store, so the others are only tried and a busy one is a conflict.
fn reorganize_pool(
    store: &Store,
    own: Option<&TxnHandle>,
    paths: &[PathBuf],
    usage_threshold: usize,
) -> Result<PoolReport> {
    let others = open_participants(store, paths)?;
    let mut participants: Vec<(PathBuf, &Store)> =
        others.iter().map(|s| (canonical(s.path()), s)).collect();

    let txns = match own {
        Some(_) => participants
            .iter()
            .map(|(_, s)| s.try_begin())
            .collect::<Result<Vec<_>>>()?,
        None => {
            participants.push((canonical(store.path()), store));
            participants.sort_by(|a, b| a.0.cmp(&b.0));
            participants
                .iter()
                .map(|(_, s)| s.begin())
                .collect::<Result<Vec<_>>>()?
        }
    };

    // the executing store leads; its pool is the one reorganized
    let mut members: Vec<(&Store, &TxnHandle)> = own.map(|t| (store, t)).into_iter().collect();
    members.extend(txns.iter().map(|t| (t.store(), t.handle())));
    members.sort_by_key(|(s, _)| !std::ptr::eq(*s, store));

    let report = pool::reorganize(&members, usage_threshold)?;
    for t in txns {
        t.commit()?;
    }
    Ok(report)
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// open the other stores of a reorganization, without `store`
fn open_participants(store: &Store, paths: &[PathBuf]) -> Result<Vec<Store>> {
    let mut seen = vec![canonical(store.path())];
    let mut stores = Vec::new();
    for path in paths.iter().map(|p| canonical(p)) {
        // a second handle on an open store would wait on its own lock
        if seen.contains(&path) {
            continue;
        }
        stores.push(Store::open(&path)?);
        seen.push(path);
    }
    Ok(stores)
}
