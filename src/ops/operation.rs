//! typed operation requests
//!
//! every operation the store supports is a request struct with builder
//! style setters. `Operation` is the closed union of all of them and
//! `Outcome` the union of their results; both are serde types so the same
//! values travel over the remote protocol.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::ops::closure::ObjectListing;
use crate::ops::diff::TransferEstimate;
use crate::ops::export::ExportStats;
use crate::ops::fsck::FsckReport;
use crate::ops::prune::PruneReport;
use crate::ops::usage::UsageReport;
use crate::pool::PoolReport;
use crate::transport::{TransferReport, TransferStats};
use crate::types::{Manifest, ManifestKey, ScanRoot, Tree, TreeDiff, TreeView};

/// anything that runs operations: a local store or a remote connection
pub trait Executor {
    fn execute(&self, op: Operation) -> Result<Outcome>;
}

/// a request with a typed result
pub trait Request: Into<Operation> {
    type Output;

    /// unwrap the outcome variant this request produces
    fn output(outcome: Outcome) -> Result<Self::Output>;
}

/// run a request and get its typed output
pub fn call<E: Executor + ?Sized, R: Request>(exec: &E, request: R) -> Result<R::Output> {
    R::output(exec.execute(request.into())?)
}

/// result of any operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Unit,
    Count(usize),
    Tag(u64),
    MaxTag(Option<u64>),
    Keys(Vec<ManifestKey>),
    Manifests(BTreeSet<ManifestKey>),
    Manifest(Option<Manifest>),
    Imported(Manifest),
    Object(ObjectId),
    Bytes(u64),
    Objects(Vec<ObjectId>),
    Sizes(BTreeMap<ObjectId, u64>),
    Inventory(BTreeMap<ManifestKey, ObjectId>),
    Listing(ObjectListing),
    View(TreeView),
    Diff(Vec<TreeDiff>),
    Estimate(TransferEstimate),
    Export(ExportStats),
    Usage(UsageReport),
    Flag(bool),
    Fsck(FsckReport),
    Prune(PruneReport),
    Copied(TransferStats),
    Transfer(TransferReport),
    Pool(PoolReport),
}

impl Outcome {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Outcome::Unit => "unit",
            Outcome::Count(_) => "count",
            Outcome::Tag(_) => "tag",
            Outcome::MaxTag(_) => "max_tag",
            Outcome::Keys(_) => "keys",
            Outcome::Manifests(_) => "manifests",
            Outcome::Manifest(_) => "manifest",
            Outcome::Imported(_) => "imported",
            Outcome::Object(_) => "object",
            Outcome::Bytes(_) => "bytes",
            Outcome::Objects(_) => "objects",
            Outcome::Sizes(_) => "sizes",
            Outcome::Inventory(_) => "inventory",
            Outcome::Listing(_) => "listing",
            Outcome::View(_) => "view",
            Outcome::Diff(_) => "diff",
            Outcome::Estimate(_) => "estimate",
            Outcome::Export(_) => "export",
            Outcome::Usage(_) => "usage",
            Outcome::Flag(_) => "flag",
            Outcome::Fsck(_) => "fsck",
            Outcome::Prune(_) => "prune",
            Outcome::Copied(_) => "copied",
            Outcome::Transfer(_) => "transfer",
            Outcome::Pool(_) => "pool",
        }
    }
}

macro_rules! take_outcome {
    (Unit, $outcome:expr) => {
        match $outcome {
            Outcome::Unit => Ok(()),
            other => Err(other),
        }
    };
    ($variant:ident, $outcome:expr) => {
        match $outcome {
            Outcome::$variant(value) => Ok(value),
            other => Err(other),
        }
    };
}

macro_rules! operations {
    ($($request:ident => $variant:ident: $output:ty,)*) => {
        /// every operation the store can run
        #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum Operation {
            $($request($request),)*
        }

        impl Operation {
            pub fn name(&self) -> &'static str {
                match self {
                    $(Operation::$request(_) => stringify!($request),)*
                }
            }
        }

        $(
            impl From<$request> for Operation {
                fn from(request: $request) -> Self {
                    Operation::$request(request)
                }
            }

            impl Request for $request {
                type Output = $output;

                fn output(outcome: Outcome) -> Result<$output> {
                    take_outcome!($variant, outcome)
                        .map_err(|other| unexpected(stringify!($request), &other))
                }
            }
        )*
    };
}

operations! {
    ListManifests => Manifests: BTreeSet<ManifestKey>,
    LoadManifest => Manifest: Option<Manifest>,
    InsertManifest => Unit: (),
    DeleteManifest => Unit: (),
    DeleteOldManifests => Keys: Vec<ManifestKey>,
    NextTag => Tag: u64,
    MaxTag => MaxTag: Option<u64>,
    ImportObject => Object: ObjectId,
    ImportFile => Object: ObjectId,
    ImportDirectory => Imported: Manifest,
    ExportObject => Bytes: u64,
    ExportTree => Export: ExportStats,
    InsertTree => Object: ObjectId,
    InsertManifestRef => Object: ObjectId,
    ListClosure => Listing: ObjectListing,
    ObjectSizes => Sizes: BTreeMap<ObjectId, u64>,
    MissingObjects => Objects: Vec<ObjectId>,
    Inventory => Inventory: BTreeMap<ManifestKey, ObjectId>,
    ScanTree => View: TreeView,
    DiffTrees => Diff: Vec<TreeDiff>,
    EstimateTransfer => Estimate: TransferEstimate,
    DiscUsage => Usage: UsageReport,
    CancelDiscUsage => Flag: bool,
    Fsck => Fsck: FsckReport,
    Prune => Prune: PruneReport,
    CopyManifests => Copied: TransferStats,
    Push => Transfer: TransferReport,
    Fetch => Transfer: TransferReport,
    EnablePooling => Unit: (),
    DisablePooling => Count: usize,
    ReorganizePool => Pool: PoolReport,
}

fn unexpected(request: &str, outcome: &Outcome) -> Error {
    Error::IllegalState(format!(
        "{} answered with a {} outcome",
        request,
        outcome.variant_name()
    ))
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// manifests

/// list manifest keys, optionally below a name prefix
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListManifests {
    pub prefix: Option<String>,
}

impl ListManifests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadManifest {
    pub key: ManifestKey,
}

impl LoadManifest {
    pub fn new(key: ManifestKey) -> Self {
        Self { key }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertManifest {
    pub manifest: Manifest,
}

impl InsertManifest {
    pub fn new(manifest: Manifest) -> Self {
        Self { manifest }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteManifest {
    pub key: ManifestKey,
}

impl DeleteManifest {
    pub fn new(key: ManifestKey) -> Self {
        Self { key }
    }
}

/// keep only the `keep` highest tags of a name
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOldManifests {
    pub name: String,
    pub keep: usize,
}

impl DeleteOldManifests {
    pub fn new(name: impl Into<String>, keep: usize) -> Self {
        Self {
            name: name.into(),
            keep,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTag {
    pub name: String,
}

impl NextTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxTag {
    pub name: String,
}

impl MaxTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// import and export

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportObject {
    pub bytes: Vec<u8>,
}

impl ImportObject {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFile {
    pub path: PathBuf,
}

impl ImportFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// store a directory and publish it under `key`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDirectory {
    pub source: PathBuf,
    pub key: ManifestKey,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ImportDirectory {
    pub fn new(source: impl Into<PathBuf>, key: ManifestKey) -> Self {
        Self {
            source: source.into(),
            key,
            labels: BTreeMap::new(),
        }
    }

    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportObject {
    pub id: ObjectId,
    pub target: PathBuf,
}

impl ExportObject {
    pub fn new(id: ObjectId, target: impl Into<PathBuf>) -> Self {
        Self {
            id,
            target: target.into(),
        }
    }
}

/// materialize a manifest or tree into an empty directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTree {
    pub root: ScanRoot,
    pub target: PathBuf,
}

impl ExportTree {
    pub fn new(root: impl Into<ScanRoot>, target: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            target: target.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertTree {
    pub tree: Tree,
}

impl InsertTree {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertManifestRef {
    pub key: ManifestKey,
}

impl InsertManifestRef {
    pub fn new(key: ManifestKey) -> Self {
        Self { key }
    }
}

// inspection

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListClosure {
    pub keys: Vec<ManifestKey>,
}

impl ListClosure {
    pub fn new(keys: impl IntoIterator<Item = ManifestKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSizes {
    pub ids: Vec<ObjectId>,
}

impl ObjectSizes {
    pub fn new(ids: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

/// which of `ids` the executor does not hold
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingObjects {
    pub ids: Vec<ObjectId>,
}

impl MissingObjects {
    pub fn new(ids: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

/// every manifest with its root tree
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub prefix: Option<String>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTree {
    pub root: ScanRoot,
    pub max_depth: Option<usize>,
    pub follow_references: bool,
}

impl ScanTree {
    pub fn new(root: impl Into<ScanRoot>) -> Self {
        Self {
            root: root.into(),
            max_depth: None,
            follow_references: false,
        }
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn follow_references(mut self, follow: bool) -> Self {
        self.follow_references = follow;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffTrees {
    pub left: ScanRoot,
    pub right: ScanRoot,
    pub follow_references: bool,
}

impl DiffTrees {
    pub fn new(left: impl Into<ScanRoot>, right: impl Into<ScanRoot>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            follow_references: false,
        }
    }

    pub fn follow_references(mut self, follow: bool) -> Self {
        self.follow_references = follow;
        self
    }
}

/// what moving from `from` (or nothing) to `to` would transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimateTransfer {
    pub from: Option<ManifestKey>,
    pub to: ManifestKey,
}

impl EstimateTransfer {
    pub fn new(to: ManifestKey) -> Self {
        Self { from: None, to }
    }

    pub fn since(mut self, from: ManifestKey) -> Self {
        self.from = Some(from);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscUsage {
    pub prefix: Option<String>,
    /// bypass the cached report
    pub fresh: bool,
}

impl DiscUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }
}

/// stop a running disc usage computation; true if one was running
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDiscUsage {
    pub prefix: Option<String>,
}

impl CancelDiscUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

// maintenance

/// check the given manifests, all of them when empty
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fsck {
    pub keys: Vec<ManifestKey>,
    pub repair: bool,
}

impl Fsck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(mut self, keys: impl IntoIterator<Item = ManifestKey>) -> Self {
        self.keys = keys.into_iter().collect();
        self
    }

    pub fn repair(mut self, repair: bool) -> Self {
        self.repair = repair;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prune {
    pub dry_run: bool,
}

impl Prune {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

// transfer

/// copy manifests with their closures into another store on this machine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyManifests {
    pub target: PathBuf,
    pub keys: Vec<ManifestKey>,
}

impl CopyManifests {
    pub fn new(target: impl Into<PathBuf>, keys: impl IntoIterator<Item = ManifestKey>) -> Self {
        Self {
            target: target.into(),
            keys: keys.into_iter().collect(),
        }
    }
}

/// send manifests to a remote, given by url or configured name
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    pub remote: String,
    pub keys: Vec<ManifestKey>,
    pub dry_run: bool,
}

impl Push {
    pub fn new(remote: impl Into<String>, keys: impl IntoIterator<Item = ManifestKey>) -> Self {
        Self {
            remote: remote.into(),
            keys: keys.into_iter().collect(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// bring manifests over from a remote, given by url or configured name
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fetch {
    pub remote: String,
    pub keys: Vec<ManifestKey>,
    pub dry_run: bool,
}

impl Fetch {
    pub fn new(remote: impl Into<String>, keys: impl IntoIterator<Item = ManifestKey>) -> Self {
        Self {
            remote: remote.into(),
            keys: keys.into_iter().collect(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

// pooling

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnablePooling {
    pub pool: PathBuf,
    /// skip the fsck precondition
    pub force: bool,
}

impl EnablePooling {
    pub fn new(pool: impl Into<PathBuf>) -> Self {
        Self {
            pool: pool.into(),
            force: false,
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisablePooling {}

impl DisablePooling {
    pub fn new() -> Self {
        Self::default()
    }
}

/// move objects used by at least `usage_threshold` stores into the pool
///
/// the executing store takes part together with `stores`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorganizePool {
    pub stores: Vec<PathBuf>,
    pub usage_threshold: usize,
}

impl ReorganizePool {
    pub fn new(stores: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            stores: stores.into_iter().collect(),
            usage_threshold: 2,
        }
    }

    pub fn usage_threshold(mut self, threshold: usize) -> Self {
        self.usage_threshold = threshold;
        self
    }
}
