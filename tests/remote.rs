use std::fs;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;

use hive::ops::{call, ImportDirectory, Inventory, ListManifests, LoadManifest, NextTag};
use hive::transport::{fetch, push, serve, RemoteStore, StoreRegistry};
use hive::{Error, ErrorKind, ManifestKey, Store};
use tempfile::tempdir;

/// a server thread answering for `stores`, and a client bound to `name`
fn connect(stores: StoreRegistry, name: &str) -> (hive::Result<RemoteStore>, thread::JoinHandle<()>) {
    let (client, server) = UnixStream::pair().unwrap();
    let handle = thread::spawn(move || {
        let reader = server.try_clone().unwrap();
        serve(&stores, reader, server).unwrap();
    });
    let remote = RemoteStore::from_streams(client.try_clone().unwrap(), client, name);
    (remote, handle)
}

fn source(dir: &Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

#[test]
fn test_operations_over_the_wire() {
    let dir = tempdir().unwrap();
    let served = Store::init(&dir.path().join("served")).unwrap();
    let src = dir.path().join("src");
    source(&src, &[("etc/os-release", "hive")]);
    let key = ManifestKey::parse("base:7").unwrap();
    call(&served, ImportDirectory::new(&src, key.clone()).label("arch", "x86_64")).unwrap();

    let (remote, server) = connect(StoreRegistry::with_default(served), "default");
    let remote = remote.unwrap();

    assert!(call(&remote, ListManifests::new()).unwrap().contains(&key));
    assert_eq!(call(&remote, NextTag::new("base")).unwrap(), 8);
    let manifest = call(&remote, LoadManifest::new(key.clone())).unwrap().unwrap();
    assert_eq!(manifest.label("arch"), Some("x86_64"));
    assert_eq!(call(&remote, Inventory::new()).unwrap().len(), 1);

    // failures keep their kind
    let missing = ManifestKey::parse("base:1").unwrap();
    match call(&remote, hive::ops::DeleteManifest::new(missing)) {
        Err(Error::Remote { kind, .. }) => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("unexpected {:?}", other),
    }

    drop(remote);
    server.join().unwrap();
}

#[test]
fn test_push_and_fetch_over_the_wire() {
    let dir = tempdir().unwrap();
    let local = Store::init(&dir.path().join("local")).unwrap();
    let served_path = dir.path().join("served");
    let served = Store::init(&served_path).unwrap();

    let src = dir.path().join("src");
    source(&src, &[("a.txt", "1"), ("b/c.txt", "2")]);
    let pushed = ManifestKey::parse("demo:1").unwrap();
    call(&local, ImportDirectory::new(&src, pushed.clone())).unwrap();

    let other = dir.path().join("other");
    source(&other, &[("a.txt", "1"), ("d.txt", "4")]);
    let fetched = ManifestKey::parse("other:1").unwrap();
    call(&served, ImportDirectory::new(&other, fetched.clone())).unwrap();

    let (remote, server) = connect(StoreRegistry::with_default(served), "default");
    let remote = remote.unwrap();

    let report = push(&local, &remote, &[pushed.clone()], false).unwrap();
    assert_eq!(report.blobs_in_closure, 2);
    // "1" is already on the server
    assert_eq!(report.blobs_transferred, 1);
    assert!(report.bytes_transferred > 0);

    let txn = local.begin().unwrap();
    let report = fetch(&local, &txn, &remote, &[fetched.clone()], false).unwrap();
    txn.commit().unwrap();
    assert_eq!(report.blobs_transferred, 1);
    assert_eq!(report.reused_blobs(), 1);
    assert!(local.has_manifest(&fetched));

    drop(remote);
    server.join().unwrap();

    let served = Store::open(&served_path).unwrap();
    assert!(served.has_manifest(&pushed));
}

#[test]
fn test_unknown_store_name() {
    let dir = tempdir().unwrap();
    let served = Store::init(dir.path()).unwrap();
    let (remote, server) = connect(StoreRegistry::with_default(served), "elsewhere");
    match remote {
        Err(Error::Remote { kind, message }) => {
            assert_eq!(kind, ErrorKind::NotFound);
            assert!(message.contains("elsewhere"));
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("opened an unregistered store"),
    }
    server.join().unwrap();
}
