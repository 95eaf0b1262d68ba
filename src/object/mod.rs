pub mod db;
pub mod tree;

pub(crate) use db::fsync_dir;
pub use db::{CopyMode, ObjectDb, ObjectReader};
pub use tree::{
    decode_manifest_ref, decode_tree, read_manifest_ref, read_tree, write_manifest_ref, write_tree,
};
