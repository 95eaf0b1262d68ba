use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::ObjectId;

/// what a tree entry points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// raw content object
    Blob,
    /// nested tree object
    Tree,
    /// object whose content is the `name:tag` key of another manifest
    Manifest,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Blob => "blob",
            EntryType::Tree => "tree",
            EntryType::Manifest => "manifest",
        }
    }
}

/// a single named child of a tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryType,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, kind: EntryType, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            kind,
            id,
        }
    }
}

/// immutable merkle node: sorted, uniquely named entries
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// create a new tree, validating and sorting entries
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self> {
        for entry in &entries {
            validate_entry_name(&entry.name)?;
        }

        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

        // one entry per name, whatever its type
        for window in entries.windows(2) {
            if window[0].name == window[1].name {
                return Err(Error::DuplicateEntryName(window[0].name.clone()));
            }
        }

        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self { entries: vec![] }
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<TreeEntry> {
        self.entries
    }

    /// look up entry by name
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// re-check the invariants of a tree decoded from storage
    pub(crate) fn validate(&self) -> Result<()> {
        for entry in &self.entries {
            validate_entry_name(&entry.name)?;
        }
        for window in self.entries.windows(2) {
            if window[0].name.as_bytes() >= window[1].name.as_bytes() {
                return Err(Error::CorruptObjectMessage(format!(
                    "tree entries out of order at {}",
                    window[1].name
                )));
            }
        }
        Ok(())
    }
}

/// accumulates entries for a new tree
#[derive(Default)]
pub struct TreeBuilder {
    entries: Vec<TreeEntry>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, name: impl Into<String>, kind: EntryType, id: ObjectId) -> Self {
        self.entries.push(TreeEntry::new(name, kind, id));
        self
    }

    pub fn blob(self, name: impl Into<String>, id: ObjectId) -> Self {
        self.entry(name, EntryType::Blob, id)
    }

    pub fn tree(self, name: impl Into<String>, id: ObjectId) -> Self {
        self.entry(name, EntryType::Tree, id)
    }

    pub fn manifest_ref(self, name: impl Into<String>, id: ObjectId) -> Self {
        self.entry(name, EntryType::Manifest, id)
    }

    pub fn push(&mut self, entry: TreeEntry) {
        self.entries.push(entry);
    }

    pub fn build(self) -> Result<Tree> {
        Tree::new(self.entries)
    }
}

/// validate an entry name
pub(crate) fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEntryName("empty name".to_string()));
    }
    if name.contains('/') {
        return Err(Error::InvalidEntryName(format!(
            "name contains '/': {}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidEntryName(format!(
            "name contains null byte: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidEntryName(format!("reserved name: {}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ObjectId {
        ObjectId::of(s.as_bytes())
    }

    #[test]
    fn test_tree_empty() {
        let tree = Tree::empty();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn test_tree_sorting() {
        let tree = TreeBuilder::new()
            .blob("zebra", id("z"))
            .tree("alpha", id("a"))
            .manifest_ref("mid", id("m"))
            .build()
            .unwrap();

        let names: Vec<_> = tree.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zebra"]);
    }

    #[test]
    fn test_tree_get() {
        let tree = TreeBuilder::new()
            .blob("a", id("1"))
            .blob("b", id("2"))
            .build()
            .unwrap();

        assert_eq!(tree.get("b").unwrap().id, id("2"));
        assert!(tree.get("c").is_none());
    }

    #[test]
    fn test_tree_rejects_bad_names() {
        for bad in ["", "a/b", "nul\0", ".", ".."] {
            let result = TreeBuilder::new().blob(bad, id("x")).build();
            assert!(
                matches!(result, Err(Error::InvalidEntryName(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_tree_rejects_same_name_different_type() {
        let result = TreeBuilder::new()
            .blob("dup", id("1"))
            .tree("dup", id("2"))
            .build();
        assert!(matches!(result, Err(Error::DuplicateEntryName(n)) if n == "dup"));
    }

    #[test]
    fn test_validate_detects_unsorted() {
        let tree = Tree {
            entries: vec![
                TreeEntry::new("b", EntryType::Blob, id("1")),
                TreeEntry::new("a", EntryType::Blob, id("2")),
            ],
        };
        assert!(tree.validate().is_err());
    }
}
