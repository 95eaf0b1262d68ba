use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::ObjectId;
use crate::types::{EntryType, ManifestKey};

/// where a scan or export starts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanRoot {
    Manifest(ManifestKey),
    Tree(ObjectId),
}

impl ScanRoot {
    /// `name:tag` selects a manifest, 64 hex chars a tree
    pub fn parse(s: &str) -> crate::Result<Self> {
        if ObjectId::looks_like_hex(s) {
            Ok(ScanRoot::Tree(ObjectId::from_hex(s)?))
        } else {
            Ok(ScanRoot::Manifest(ManifestKey::parse(s)?))
        }
    }
}

impl From<ManifestKey> for ScanRoot {
    fn from(key: ManifestKey) -> Self {
        ScanRoot::Manifest(key)
    }
}

impl From<ObjectId> for ScanRoot {
    fn from(id: ObjectId) -> Self {
        ScanRoot::Tree(id)
    }
}

/// in-memory image of a scanned tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeView {
    Blob {
        id: ObjectId,
        size: u64,
    },
    Tree {
        id: ObjectId,
        children: BTreeMap<String, TreeView>,
        /// children were not scanned because of the depth limit
        truncated: bool,
    },
    ManifestRef {
        id: ObjectId,
        key: ManifestKey,
        /// the referenced manifest's root, when followed and present
        expanded: Option<Box<TreeView>>,
    },
    Missing {
        id: ObjectId,
        expected: EntryType,
    },
}

impl TreeView {
    pub fn id(&self) -> &ObjectId {
        match self {
            TreeView::Blob { id, .. }
            | TreeView::Tree { id, .. }
            | TreeView::ManifestRef { id, .. }
            | TreeView::Missing { id, .. } => id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            TreeView::Blob { .. } => "blob",
            TreeView::Tree { .. } => "tree",
            TreeView::ManifestRef { .. } => "manifest",
            TreeView::Missing { .. } => "missing",
        }
    }

    /// direct children, looking through an expanded manifest reference
    pub fn children(&self) -> Option<&BTreeMap<String, TreeView>> {
        match self {
            TreeView::Tree { children, .. } => Some(children),
            TreeView::ManifestRef {
                expanded: Some(view),
                ..
            } => view.children(),
            _ => None,
        }
    }

    /// resolve a '/'-separated path below this node
    pub fn find(&self, path: &str) -> Option<&TreeView> {
        let mut node = self;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.children()?.get(part)?;
        }
        Some(node)
    }

    /// visit every node below this one in sorted pre-order
    pub fn walk<F: FnMut(&str, &TreeView)>(&self, mut f: F) {
        fn go<F: FnMut(&str, &TreeView)>(node: &TreeView, prefix: &str, f: &mut F) {
            if let Some(children) = node.children() {
                for (name, child) in children {
                    let path = join_path(prefix, name);
                    f(&path, child);
                    go(child, &path, f);
                }
            }
        }
        go(self, "", &mut f);
    }

    /// true if any node in the view is missing
    pub fn has_missing(&self) -> bool {
        let mut missing = matches!(self, TreeView::Missing { .. });
        self.walk(|_, node| missing |= matches!(node, TreeView::Missing { .. }));
        missing
    }
}

pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// kind of difference between two views at one path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    OnlyLeft,
    OnlyRight,
    ContentDiff,
}

impl DiffKind {
    /// the same difference seen from the other side
    pub fn mirrored(self) -> Self {
        match self {
            DiffKind::OnlyLeft => DiffKind::OnlyRight,
            DiffKind::OnlyRight => DiffKind::OnlyLeft,
            DiffKind::ContentDiff => DiffKind::ContentDiff,
        }
    }
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffKind::OnlyLeft => write!(f, "-"),
            DiffKind::OnlyRight => write!(f, "+"),
            DiffKind::ContentDiff => write!(f, "M"),
        }
    }
}

/// one entry of a tree diff
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDiff {
    pub path: String,
    pub kind: DiffKind,
}

impl fmt::Display for TreeDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(s: &str) -> TreeView {
        TreeView::Blob {
            id: ObjectId::of(s.as_bytes()),
            size: s.len() as u64,
        }
    }

    fn dir(children: Vec<(&str, TreeView)>) -> TreeView {
        TreeView::Tree {
            id: ObjectId::of(format!("{:?}", children).as_bytes()),
            children: children
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
            truncated: false,
        }
    }

    #[test]
    fn test_find_and_walk() {
        let view = dir(vec![("a.txt", blob("1")), ("b", dir(vec![("c.txt", blob("2"))]))]);
        assert_eq!(view.find("b/c.txt"), Some(&blob("2")));
        assert!(view.find("b/missing").is_none());

        let mut paths = vec![];
        view.walk(|p, _| paths.push(p.to_string()));
        assert_eq!(paths, vec!["a.txt", "b", "b/c.txt"]);
    }

    #[test]
    fn test_scan_root_parse() {
        let id = ObjectId::of(b"x");
        assert_eq!(ScanRoot::parse(&id.to_hex()).unwrap(), ScanRoot::Tree(id));
        assert!(matches!(
            ScanRoot::parse("demo:1").unwrap(),
            ScanRoot::Manifest(_)
        ));
    }

    #[test]
    fn test_has_missing() {
        let view = dir(vec![(
            "gone",
            TreeView::Missing {
                id: ObjectId::of(b"gone"),
                expected: EntryType::Blob,
            },
        )]);
        assert!(view.has_missing());
        assert!(!blob("x").has_missing());
    }

    #[test]
    fn test_diff_display() {
        let d = TreeDiff {
            path: "b/c.txt".into(),
            kind: DiffKind::ContentDiff,
        };
        assert_eq!(d.to_string(), "M b/c.txt");
        assert_eq!(DiffKind::OnlyLeft.mirrored(), DiffKind::OnlyRight);
    }
}
