//! server side of the wire protocol
//!
//! `hive serve` runs this on stdin/stdout; ssh clients reach it that way.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::ops::Executor;
use crate::store::Store;
use crate::transport::archive::{pack_to_file, unpack_into, ImportSummary};
use crate::transport::protocol::{self, Request, Response};
use crate::transport::remote::DEFAULT_STORE;

/// stores a server answers for, by name
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: BTreeMap<String, Arc<Store>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// a registry serving `store` under the default name
    pub fn with_default(store: Store) -> Self {
        let mut registry = Self::new();
        registry.insert(DEFAULT_STORE, store);
        registry
    }

    pub fn insert(&mut self, name: impl Into<String>, store: Store) {
        self.stores.insert(name.into(), Arc::new(store));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Store>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StoreNotRegistered(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }
}

/// answer requests until the client quits or disconnects
///
/// failures of single requests go back to the client; only a broken
/// connection ends the session with an error.
pub fn serve<R: Read, W: Write>(registry: &StoreRegistry, mut reader: R, mut writer: W) -> Result<()> {
    let mut current: Option<Arc<Store>> = None;

    while let Some(request) = protocol::receive::<_, Request>(&mut reader)? {
        match request {
            Request::Open { store } => {
                let response = match registry.get(&store) {
                    Ok(opened) => {
                        debug!(store = %store, "store selected");
                        current = Some(opened);
                        Response::Ready
                    }
                    Err(e) => Response::failed(&e),
                };
                protocol::send(&mut writer, &response)?;
            }
            Request::Execute(op) => {
                let name = op.name();
                let response = match selected(&current).and_then(|s| s.execute(op)) {
                    Ok(outcome) => Response::Outcome(outcome),
                    Err(e) => {
                        warn!(op = name, error = %e, "operation failed");
                        Response::failed(&e)
                    }
                };
                protocol::send(&mut writer, &response)?;
            }
            Request::Upload => {
                // the archive is consumed in full so the stream stays in step
                let staging = tempfile::NamedTempFile::new().with_path(std::env::temp_dir())?;
                let mut file = staging.reopen().with_path(staging.path())?;
                protocol::receive_stream(&mut reader, &mut file)?;
                let response = match selected(&current).and_then(|s| import(&s, staging.path())) {
                    Ok(summary) => Response::Imported(summary),
                    Err(e) => {
                        warn!(error = %e, "upload rejected");
                        Response::failed(&e)
                    }
                };
                protocol::send(&mut writer, &response)?;
            }
            Request::Download(archive) => {
                let staging = tempfile::NamedTempFile::new().with_path(std::env::temp_dir())?;
                match selected(&current).and_then(|s| pack_to_file(&s, &archive, staging.path())) {
                    Ok(size) => {
                        protocol::send(&mut writer, &Response::Archive { size })?;
                        let mut file = File::open(staging.path()).with_path(staging.path())?;
                        protocol::send_stream(&mut writer, &mut file)?;
                    }
                    Err(e) => protocol::send(&mut writer, &Response::failed(&e))?,
                }
            }
            Request::Quit => break,
        }
    }

    info!("client disconnected");
    Ok(())
}

fn selected(current: &Option<Arc<Store>>) -> Result<Arc<Store>> {
    current
        .clone()
        .ok_or_else(|| Error::IllegalState("no store opened".to_string()))
}

fn import(store: &Store, archive: &std::path::Path) -> Result<ImportSummary> {
    let file = File::open(archive).with_path(archive)?;
    let txn = store.begin()?;
    let summary = unpack_into(store, &txn, file)?;
    txn.commit()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ops::{NextTag, Operation, Outcome};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn replies(registry: &StoreRegistry, requests: &[Request]) -> Vec<Response> {
        let mut input = Vec::new();
        for request in requests {
            protocol::send(&mut input, request).unwrap();
        }
        let mut output = Vec::new();
        serve(registry, Cursor::new(input), &mut output).unwrap();

        let mut reader = Cursor::new(output);
        let mut responses = Vec::new();
        while let Some(response) = protocol::receive(&mut reader).unwrap() {
            responses.push(response);
        }
        responses
    }

    #[test]
    fn test_open_then_execute() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::with_default(Store::init(dir.path()).unwrap());
        let responses = replies(
            &registry,
            &[
                Request::Execute(NextTag::new("demo").into()),
                Request::Open { store: "elsewhere".into() },
                Request::Open { store: "default".into() },
                Request::Execute(Operation::NextTag(NextTag::new("demo"))),
                Request::Quit,
                Request::Open { store: "default".into() },
            ],
        );

        assert_eq!(responses.len(), 4);
        assert!(matches!(&responses[0], Response::Failed { kind: ErrorKind::IllegalState, .. }));
        assert!(matches!(&responses[1], Response::Failed { kind: ErrorKind::NotFound, .. }));
        assert_eq!(responses[2], Response::Ready);
        assert_eq!(responses[3], Response::Outcome(Outcome::Tag(1)));
    }

    #[test]
    fn test_rejected_upload_keeps_session() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::with_default(Store::init(dir.path()).unwrap());

        let mut input = Vec::new();
        protocol::send(&mut input, &Request::Open { store: "default".into() }).unwrap();
        protocol::send(&mut input, &Request::Upload).unwrap();
        protocol::send_stream(&mut input, &mut &b"not a tar archive"[..]).unwrap();
        protocol::send(&mut input, &Request::Execute(NextTag::new("x").into())).unwrap();

        let mut output = Vec::new();
        serve(&registry, Cursor::new(input), &mut output).unwrap();
        let mut reader = Cursor::new(output);
        let ready: Response = protocol::expect(&mut reader).unwrap();
        assert_eq!(ready, Response::Ready);
        let rejected: Response = protocol::expect(&mut reader).unwrap();
        assert!(matches!(rejected, Response::Failed { .. }));
        let tag: Response = protocol::expect(&mut reader).unwrap();
        assert_eq!(tag, Response::Outcome(Outcome::Tag(1)));
    }

    #[test]
    fn test_registry_lookup() {
        let dir = tempdir().unwrap();
        let mut registry = StoreRegistry::new();
        registry.insert("a", Store::init(&dir.path().join("a")).unwrap());
        registry.insert("b", Store::init(&dir.path().join("b")).unwrap());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(matches!(registry.get("c"), Err(Error::StoreNotRegistered(_))));
    }
}
