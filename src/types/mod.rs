mod manifest;
mod tree;
mod view;

pub use manifest::{Manifest, ManifestBuilder, ManifestKey};
pub(crate) use manifest::{validate_name, MANIFEST_SUFFIX};
pub use tree::{EntryType, Tree, TreeBuilder, TreeEntry};
pub(crate) use view::join_path;
pub use view::{DiffKind, ScanRoot, TreeDiff, TreeView};
