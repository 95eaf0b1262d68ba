//! moving manifests between stores
//!
//! a remote is anything that executes operations and accepts or produces
//! transfer archives: another store on disk, or a store behind `hive serve`.

pub mod archive;
pub mod fetch;
pub mod local;
pub mod protocol;
pub mod push;
pub mod remote;
pub mod serve;

use std::path::Path;

pub use archive::{pack, unpack_into, ArchiveRequest, ImportSummary};
pub use fetch::fetch;
pub use local::{copy_manifests, copy_objects, LocalRemote, TransferStats};
pub use push::{push, TransferReport};
pub use remote::{RemoteStore, DEFAULT_STORE};
pub use serve::{serve, StoreRegistry};

use crate::error::{Error, Result};
use crate::ops::Executor;

/// the far side of a push or fetch
pub trait Remote: Executor + Send {
    /// import an archive file, all or nothing
    fn upload(&self, archive: &Path) -> Result<ImportSummary>;

    /// write the archive for `request` to `dest`, returning its size
    fn download(&self, request: &ArchiveRequest, dest: &Path) -> Result<u64>;
}

/// open a remote by url: `ssh://...`, `file://...` or a plain path
pub fn open_remote(url: &str) -> Result<Box<dyn Remote>> {
    if url.starts_with("ssh://") {
        return Ok(Box::new(RemoteStore::ssh(url)?));
    }
    let path = url.strip_prefix("file://").unwrap_or(url);
    if path.is_empty() || path.contains("://") {
        return Err(Error::transport(format!("unsupported remote url: {}", url)));
    }
    Ok(Box::new(LocalRemote::open(Path::new(path))?))
}
