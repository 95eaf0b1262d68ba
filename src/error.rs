use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hash::ObjectId;
use crate::types::ManifestKey;

/// error type for hive operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store not found at {0}")]
    NoStore(PathBuf),

    #[error("store already exists at {0}")]
    StoreExists(PathBuf),

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("manifest not found: {0}")]
    ManifestNotFound(ManifestKey),

    #[error("path not found in tree: {0}")]
    PathNotFound(String),

    #[error("store not registered: {0}")]
    StoreNotRegistered(String),

    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    #[error("corrupt object: hash mismatch for {0}")]
    CorruptObject(ObjectId),

    #[error("corrupt object: {0}")]
    CorruptObjectMessage(String),

    #[error("manifest already exists: {0}")]
    ManifestExists(ManifestKey),

    #[error("remote already exists: {0}")]
    RemoteExists(String),

    #[error("export target not empty: {0}")]
    TargetNotEmpty(PathBuf),

    #[error("store is busy: {0}")]
    StoreBusy(PathBuf),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid manifest key: {0}")]
    InvalidManifestKey(String),

    #[error("invalid tree entry name: {0}")]
    InvalidEntryName(String),

    #[error("duplicate tree entry name: {0}")]
    DuplicateEntryName(String),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("remote error ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },

    /// an error replicated from another thread's computation
    #[error("{message}")]
    Shared { kind: ErrorKind, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

/// coarse classification of errors, stable across the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Corruption,
    Conflict,
    IllegalState,
    Transport,
    Io,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Conflict => "conflict",
            ErrorKind::IllegalState => "illegal state",
            ErrorKind::Transport => "transport",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoStore(_)
            | Error::ObjectNotFound(_)
            | Error::ManifestNotFound(_)
            | Error::PathNotFound(_)
            | Error::StoreNotRegistered(_)
            | Error::RemoteNotFound(_) => ErrorKind::NotFound,
            Error::CorruptObject(_) | Error::CorruptObjectMessage(_) | Error::CborDecode(_) => {
                ErrorKind::Corruption
            }
            Error::StoreExists(_)
            | Error::ManifestExists(_)
            | Error::RemoteExists(_)
            | Error::TargetNotEmpty(_)
            | Error::StoreBusy(_) => ErrorKind::Conflict,
            Error::IllegalState(_)
            | Error::MissingParameter(_)
            | Error::InvalidManifestKey(_)
            | Error::InvalidEntryName(_)
            | Error::DuplicateEntryName(_)
            | Error::InvalidHashHex(_)
            | Error::CborEncode(_)
            | Error::Config(_)
            | Error::ConfigSerialize(_) => ErrorKind::IllegalState,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Remote { kind, .. } | Error::Shared { kind, .. } => *kind,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io { .. } => ErrorKind::Io,
        }
    }

    /// rebuild an error from its kind and rendered message
    pub(crate) fn shared(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Cancelled => Error::Cancelled,
            kind => Error::Shared { kind, message },
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
