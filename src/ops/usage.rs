use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::flight::{CancelToken, SingleFlight};
use crate::hash::ObjectId;
use crate::ops::closure::partial_closure;
use crate::store::Store;
use crate::types::ManifestKey;

/// disc usage of one manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub key: ManifestKey,
    /// objects in the closure
    pub objects: usize,
    /// on-disk bytes of the closure
    pub total_bytes: u64,
    /// bytes no other manifest of the store references
    pub exclusive_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub entries: Vec<UsageEntry>,
    /// bytes of listed objects referenced by more than one manifest
    pub shared_bytes: u64,
    /// bytes of all distinct listed objects
    pub total_bytes: u64,
}

/// compute disc usage for manifests under `prefix`
///
/// exclusivity is judged against every manifest in the store, not only the
/// listed ones. missing objects and dangling references count as zero bytes.
/// the token is polled between manifests.
pub fn disc_usage(store: &Store, prefix: Option<&str>, token: &CancelToken) -> Result<UsageReport> {
    let listed = store.list_manifests(prefix)?;

    let mut closures = Vec::new();
    let mut refcount: HashMap<ObjectId, usize> = HashMap::new();
    for key in store.list_manifests(None)? {
        token.check()?;
        let listing = partial_closure(store, std::slice::from_ref(&key))?;
        for id in listing.objects() {
            *refcount.entry(*id).or_default() += 1;
        }
        if listed.contains(&key) {
            closures.push((key, listing));
        }
    }

    let mut sizes: HashMap<ObjectId, u64> = HashMap::new();
    let mut report = UsageReport::default();
    for (key, listing) in closures {
        token.check()?;
        let mut entry = UsageEntry {
            key,
            objects: listing.object_count(),
            total_bytes: 0,
            exclusive_bytes: 0,
        };
        for id in listing.objects() {
            let seen = sizes.contains_key(id);
            let bytes = match sizes.get(id) {
                Some(bytes) => *bytes,
                None => {
                    let bytes = disk_size(store, id)?;
                    sizes.insert(*id, bytes);
                    bytes
                }
            };
            entry.total_bytes += bytes;
            let shared = refcount.get(id).copied().unwrap_or(0) > 1;
            if !shared {
                entry.exclusive_bytes += bytes;
            }
            if !seen {
                report.total_bytes += bytes;
                if shared {
                    report.shared_bytes += bytes;
                }
            }
        }
        report.entries.push(entry);
    }

    debug!(
        manifests = report.entries.len(),
        bytes = report.total_bytes,
        "computed disc usage"
    );
    Ok(report)
}

/// on-disk bytes wherever the object lives; absent objects count as zero
fn disk_size(store: &Store, id: &ObjectId) -> Result<u64> {
    match store.locate(id) {
        Some(db) => match db.disk_size(id) {
            Err(Error::ObjectNotFound(_)) => Ok(0),
            other => other,
        },
        None => Ok(0),
    }
}

/// disc usage served through a single-flight cache
pub struct UsageCache {
    flights: SingleFlight<String, UsageReport>,
}

impl UsageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            flights: SingleFlight::new(ttl),
        }
    }

    /// cached report, recomputed after manifest changes or ttl expiry
    pub fn report(&self, store: &Store, prefix: Option<&str>) -> Result<UsageReport> {
        let slot = prefix.unwrap_or_default().to_string();
        self.flights
            .get(&slot, store.manifest_generation()?, |token| {
                disc_usage(store, prefix, token)
            })
    }

    /// cancel a running computation; its waiters fail with `Cancelled`
    pub fn cancel(&self, prefix: Option<&str>) -> bool {
        self.flights.cancel(&prefix.unwrap_or_default().to_string())
    }

    pub fn invalidate(&self, prefix: Option<&str>) {
        match prefix {
            Some(prefix) => self.flights.invalidate(Some(&prefix.to_string())),
            None => self.flights.invalidate(None),
        }
    }
}
