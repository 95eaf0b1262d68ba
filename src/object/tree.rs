use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::store::Store;
use crate::txn::TxnHandle;
use crate::types::{ManifestKey, Tree};

/// write a tree to the object store
///
/// trees are serialized as CBOR; the id is the hash of that encoding.
pub fn write_tree(store: &Store, txn: &TxnHandle, tree: &Tree) -> Result<ObjectId> {
    let mut cbor_bytes = Vec::new();
    ciborium::into_writer(tree, &mut cbor_bytes)?;
    store.put(txn, &cbor_bytes)
}

/// decode a tree object's content
pub fn decode_tree(id: &ObjectId, content: &[u8]) -> Result<Tree> {
    if ObjectId::of(content) != *id {
        return Err(Error::CorruptObject(*id));
    }
    let tree: Tree = ciborium::from_reader(content)?;
    tree.validate()?;
    Ok(tree)
}

/// read a tree from the object store
pub fn read_tree(store: &Store, id: &ObjectId) -> Result<Tree> {
    decode_tree(id, &store.read(id)?)
}

/// store the key text a manifest reference entry points at
pub fn write_manifest_ref(store: &Store, txn: &TxnHandle, key: &ManifestKey) -> Result<ObjectId> {
    store.put(txn, key.to_string().as_bytes())
}

/// parse the key held by a manifest reference object
pub fn decode_manifest_ref(id: &ObjectId, content: &[u8]) -> Result<ManifestKey> {
    let text = std::str::from_utf8(content)
        .map_err(|_| Error::CorruptObjectMessage(format!("manifest reference {} is not utf-8", id)))?;
    ManifestKey::parse(text.trim())
}

pub fn read_manifest_ref(store: &Store, id: &ObjectId) -> Result<ManifestKey> {
    decode_manifest_ref(id, &store.read(id)?)
}
