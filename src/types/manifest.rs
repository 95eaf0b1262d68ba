use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::ObjectId;

/// file suffix of manifest records, reserved in names
pub(crate) const MANIFEST_SUFFIX: &str = ".manifest";

/// `(name, tag)` identifying one immutable manifest
///
/// the textual form is `name:tag`, split at the last ':'.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey {
    name: String,
    tag: String,
}

impl ManifestKey {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let tag = tag.into();
        validate_name(&name)?;
        validate_tag(&tag)?;
        Ok(Self { name, tag })
    }

    /// key with a numeric tag, as allocated by `next_tag`
    pub fn numbered(name: impl Into<String>, tag: u64) -> Result<Self> {
        Self::new(name, tag.to_string())
    }

    /// parse `name:tag`
    pub fn parse(s: &str) -> Result<Self> {
        let (name, tag) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidManifestKey(format!("missing ':' in {}", s)))?;
        Self::new(name, tag)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// the tag as a number, if it is all digits
    pub fn numeric_tag(&self) -> Option<u64> {
        numeric(&self.tag)
    }
}

fn numeric(tag: &str) -> Option<u64> {
    if tag.bytes().all(|b| b.is_ascii_digit()) {
        tag.parse().ok()
    } else {
        None
    }
}

/// numeric tags first in numeric order, then the rest lexically
fn compare_tags(a: &str, b: &str) -> Ordering {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

impl Ord for ManifestKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| compare_tags(&self.tag, &other.tag))
    }
}

impl PartialOrd for ManifestKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl fmt::Debug for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManifestKey({}:{})", self.name, self.tag)
    }
}

impl FromStr for ManifestKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ManifestKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ManifestKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// validate a manifest name: '/'-separated segments, no traversal
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let invalid = |why: &str| Err(Error::InvalidManifestKey(format!("{}: {:?}", why, name)));

    if name.is_empty() {
        return invalid("empty name");
    }
    if name.contains(':') || name.contains('\0') {
        return invalid("name contains ':' or null byte");
    }
    for segment in name.split('/') {
        if segment.is_empty() {
            return invalid("empty name segment");
        }
        if segment.starts_with('.') {
            return invalid("name segment starts with '.'");
        }
        if segment.ends_with(MANIFEST_SUFFIX) {
            return invalid("name segment uses the reserved manifest suffix");
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(Error::InvalidManifestKey("empty tag".to_string()));
    }
    if tag.contains(['/', ':', '\0']) || tag.starts_with('.') {
        return Err(Error::InvalidManifestKey(format!("invalid tag: {:?}", tag)));
    }
    Ok(())
}

/// immutable version pointer: key, root tree and free-form labels
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    key: ManifestKey,
    root: ObjectId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

impl Manifest {
    pub fn builder(key: ManifestKey) -> ManifestBuilder {
        ManifestBuilder::new(key)
    }

    pub fn key(&self) -> &ManifestKey {
        &self.key
    }

    /// id of the root tree
    pub fn root(&self) -> &ObjectId {
        &self.root
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// builder for a [`Manifest`]
#[derive(Clone, Debug)]
pub struct ManifestBuilder {
    key: ManifestKey,
    root: Option<ObjectId>,
    labels: BTreeMap<String, String>,
}

impl ManifestBuilder {
    pub fn new(key: ManifestKey) -> Self {
        Self {
            key,
            root: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn root(mut self, root: ObjectId) -> Self {
        self.root = Some(root);
        self
    }

    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn labels(mut self, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn build(self) -> Result<Manifest> {
        let root = self.root.ok_or(Error::MissingParameter("root"))?;
        Ok(Manifest {
            key: self.key,
            root,
            labels: self.labels,
        })
    }
}
