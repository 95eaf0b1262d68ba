use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ops::closure::closure;
use crate::ops::scan::{scan, ScanOptions};
use crate::store::Store;
use crate::types::{join_path, DiffKind, ManifestKey, ScanRoot, TreeDiff, TreeView};

/// compare two views by walking both in lockstep
///
/// unchanged paths are omitted and subtrees with equal ids are skipped.
/// a path present on one side only is reported with all its descendants.
pub fn diff(left: &TreeView, right: &TreeView) -> Vec<TreeDiff> {
    let mut out = Vec::new();
    diff_nodes("", left, right, &mut out);
    out
}

/// scan two roots fully and diff them
pub fn diff_trees(
    store: &Store,
    left: &ScanRoot,
    right: &ScanRoot,
    follow_references: bool,
) -> Result<Vec<TreeDiff>> {
    let options = ScanOptions {
        max_depth: None,
        follow_references,
    };
    let left = scan(store, left, options)?;
    let right = scan(store, right, options)?;
    Ok(diff(&left, &right))
}

fn diff_nodes(path: &str, left: &TreeView, right: &TreeView, out: &mut Vec<TreeDiff>) {
    let same_kind = std::mem::discriminant(left) == std::mem::discriminant(right);
    if same_kind && left.id() == right.id() {
        return;
    }
    match (left.children(), right.children()) {
        (Some(l), Some(r)) if same_kind => diff_children(path, l, r, out),
        _ => out.push(TreeDiff {
            path: path.to_string(),
            kind: DiffKind::ContentDiff,
        }),
    }
}

fn diff_children(
    prefix: &str,
    left: &BTreeMap<String, TreeView>,
    right: &BTreeMap<String, TreeView>,
    out: &mut Vec<TreeDiff>,
) {
    let mut l = left.iter().peekable();
    let mut r = right.iter().peekable();

    loop {
        match (l.peek(), r.peek()) {
            (Some((ln, lv)), Some((rn, rv))) => match ln.cmp(rn) {
                std::cmp::Ordering::Less => {
                    report_all(&join_path(prefix, ln), lv, DiffKind::OnlyLeft, out);
                    l.next();
                }
                std::cmp::Ordering::Greater => {
                    report_all(&join_path(prefix, rn), rv, DiffKind::OnlyRight, out);
                    r.next();
                }
                std::cmp::Ordering::Equal => {
                    diff_nodes(&join_path(prefix, ln), lv, rv, out);
                    l.next();
                    r.next();
                }
            },
            (Some((ln, lv)), None) => {
                report_all(&join_path(prefix, ln), lv, DiffKind::OnlyLeft, out);
                l.next();
            }
            (None, Some((rn, rv))) => {
                report_all(&join_path(prefix, rn), rv, DiffKind::OnlyRight, out);
                r.next();
            }
            (None, None) => break,
        }
    }
}

/// report a one-sided node and everything below it
fn report_all(path: &str, node: &TreeView, kind: DiffKind, out: &mut Vec<TreeDiff>) {
    out.push(TreeDiff {
        path: path.to_string(),
        kind,
    });
    if let Some(children) = node.children() {
        for (name, child) in children {
            report_all(&join_path(path, name), child, kind, out);
        }
    }
}

/// objects and bytes needed to go from one manifest to another
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEstimate {
    pub objects: usize,
    pub bytes: u64,
}

/// closure(to) minus closure(from), summed by object size
pub fn estimate_transfer(
    store: &Store,
    from: Option<&ManifestKey>,
    to: &ManifestKey,
) -> Result<TransferEstimate> {
    let target = closure(store, std::slice::from_ref(to))?;
    let have = match from {
        Some(from) => closure(store, std::slice::from_ref(from))?,
        None => Default::default(),
    };

    let mut estimate = TransferEstimate::default();
    for id in target.objects().filter(|id| !have.contains(id)) {
        estimate.objects += 1;
        estimate.bytes += store.size(id)?;
    }
    Ok(estimate)
}
