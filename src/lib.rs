//! hive - content-addressed versioned object store
//!
//! stores directory trees as immutable, deduplicated objects and names them
//! through manifests. stores can share a pool of objects and synchronize
//! manifests with each other, locally or over ssh.
//!
//! # Core concepts
//!
//! - **Object**: immutable content addressed by its SHA-256 (zstd on disk)
//! - **Tree**: a serialized directory listing (CBOR), itself an object
//! - **Manifest**: a named, labelled pointer `name:tag` to a root tree
//! - **Manifest reference**: a tree entry that mounts another manifest
//! - **Pool**: a shared object directory several stores resolve through
//!
//! # Object id
//!
//! id = SHA256(content); trees hash their canonical encoding, so identical
//! directories share one object.
//!
//! # Example usage
//!
//! ```no_run
//! use hive::ops::{call, ExportTree, ImportDirectory, NextTag};
//! use hive::{ManifestKey, Store};
//! use std::path::Path;
//!
//! let store = Store::init(Path::new("/path/to/store")).unwrap();
//!
//! let tag = call(&store, NextTag::new("rootfs")).unwrap();
//! let key = ManifestKey::numbered("rootfs", tag).unwrap();
//! call(&store, ImportDirectory::new("/source", key.clone())).unwrap();
//!
//! call(&store, ExportTree::new(key, "/destination")).unwrap();
//! ```

mod config;
mod error;
mod flight;
mod hash;
mod manifests;
mod store;
mod txn;

pub mod object;
pub mod ops;
pub mod pool;
pub mod transport;
pub mod types;

pub use config::{Config, Remote as RemoteConfig};
pub use error::{Error, ErrorKind, IoResultExt, Result};
pub use flight::{CancelToken, SingleFlight};
pub use hash::{ObjectHasher, ObjectId};
pub use object::{CopyMode, ObjectDb};
pub use ops::{call, Executor, Operation, Outcome, Request};
pub use store::Store;
pub use transport::{open_remote, Remote, RemoteStore, StoreRegistry};
pub use txn::{Transaction, TxnHandle};
pub use types::{
    DiffKind, EntryType, Manifest, ManifestBuilder, ManifestKey, ScanRoot, Tree, TreeBuilder,
    TreeDiff, TreeEntry, TreeView,
};
