use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{ObjectHasher, ObjectId};

/// zstd level for stored objects (fast, reasonable ratio)
const COMPRESSION_LEVEL: i32 = 3;

/// size of the little-endian content length prefix
const HEADER_LEN: usize = 8;

const BUF_SIZE: usize = 64 * 1024;

/// how an object arrived in a database
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyMode {
    Hardlinked,
    Copied,
    Skipped,
}

/// sharded directory of compressed, content-addressed objects
///
/// layout: `<root>/XX/YYYY…`, each file an 8-byte LE content length
/// followed by a zstd stream of the content.
#[derive(Debug)]
pub struct ObjectDb {
    root: PathBuf,
    tmp: PathBuf,
}

impl ObjectDb {
    pub fn new(root: impl Into<PathBuf>, tmp: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp: tmp.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// filesystem path of an object
    pub fn path_of(&self, id: &ObjectId) -> PathBuf {
        let (dir, file) = id.to_path_components();
        self.root.join(dir).join(file)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.path_of(id).is_file()
    }

    /// store a complete buffer; `shared` is consulted before writing
    pub fn write(&self, content: &[u8], shared: Option<&ObjectDb>) -> Result<ObjectId> {
        let id = ObjectId::of(content);
        if self.contains(&id) || shared.is_some_and(|db| db.contains(&id)) {
            return Ok(id);
        }
        let tmp_path = self.tmp_file();
        let result = (|| {
            let mut file = File::create(&tmp_path).with_path(&tmp_path)?;
            file.write_all(&(content.len() as u64).to_le_bytes())
                .with_path(&tmp_path)?;
            let mut encoder =
                zstd::stream::write::Encoder::new(file, COMPRESSION_LEVEL).with_path(&tmp_path)?;
            encoder.write_all(content).with_path(&tmp_path)?;
            let file = encoder.finish().with_path(&tmp_path)?;
            file.sync_all().with_path(&tmp_path)?;
            self.install(&tmp_path, &id)
        })();
        discard_tmp(&tmp_path, result).map(|()| id)
    }

    /// store content from a reader, hashing and compressing in one pass
    pub fn write_streaming<R: Read>(
        &self,
        reader: &mut R,
        shared: Option<&ObjectDb>,
    ) -> Result<ObjectId> {
        let tmp_path = self.tmp_file();
        let result = (|| {
            let mut file = File::create(&tmp_path).with_path(&tmp_path)?;
            file.write_all(&[0u8; HEADER_LEN]).with_path(&tmp_path)?;

            let mut hasher = ObjectHasher::new();
            let mut encoder =
                zstd::stream::write::Encoder::new(file, COMPRESSION_LEVEL).with_path(&tmp_path)?;
            let mut buf = vec![0u8; BUF_SIZE];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e).with_path(&tmp_path),
                };
                hasher.update(&buf[..n]);
                encoder.write_all(&buf[..n]).with_path(&tmp_path)?;
            }
            let mut file = encoder.finish().with_path(&tmp_path)?;

            // patch the length prefix now that it is known
            file.seek(SeekFrom::Start(0)).with_path(&tmp_path)?;
            file.write_all(&hasher.len().to_le_bytes())
                .with_path(&tmp_path)?;
            file.sync_all().with_path(&tmp_path)?;

            let id = hasher.finalize();
            if self.contains(&id) || shared.is_some_and(|db| db.contains(&id)) {
                fs::remove_file(&tmp_path).with_path(&tmp_path)?;
                return Ok(id);
            }
            self.install(&tmp_path, &id)?;
            Ok(id)
        })();
        match result {
            Ok(id) => Ok(id),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    /// move a finished temp file into place and fsync the shard directory
    fn install(&self, tmp_path: &Path, id: &ObjectId) -> Result<()> {
        let path = self.path_of(id);
        let shard = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&shard).with_path(&shard)?;
        fs::rename(tmp_path, &path).with_path(&path)?;
        fsync_dir(&shard)?;
        debug!(object = %id, "stored object");
        Ok(())
    }

    fn tmp_file(&self) -> PathBuf {
        self.tmp.join(uuid::Uuid::new_v4().to_string())
    }

    /// open an object for streaming, decompressing reads
    pub fn open(&self, id: &ObjectId) -> Result<ObjectReader> {
        let path = self.path_of(id);
        let mut file = File::open(&path).map_err(|e| not_found_or_io(e, id, &path))?;
        let size = read_header(&mut file, id)?;
        let decoder = zstd::stream::read::Decoder::new(file).with_path(&path)?;
        Ok(ObjectReader { decoder, size })
    }

    /// read a whole object into memory
    pub fn read(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let mut reader = self.open(id)?;
        // the header is untrusted until the content agrees with it
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .map_err(|e| Error::CorruptObjectMessage(format!("{}: {}", id, e)))?;
        if content.len() as u64 != reader.size() {
            return Err(Error::CorruptObjectMessage(format!(
                "{}: header says {} bytes, content has {}",
                id,
                reader.size(),
                content.len()
            )));
        }
        Ok(content)
    }

    /// uncompressed size, from the header alone
    pub fn size(&self, id: &ObjectId) -> Result<u64> {
        let path = self.path_of(id);
        let mut file = File::open(&path).map_err(|e| not_found_or_io(e, id, &path))?;
        read_header(&mut file, id)
    }

    /// bytes the object occupies on disk
    pub fn disk_size(&self, id: &ObjectId) -> Result<u64> {
        let path = self.path_of(id);
        fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| not_found_or_io(e, id, &path))
    }

    /// rehash the content; false if it does not match its id
    pub fn verify(&self, id: &ObjectId) -> Result<bool> {
        let mut reader = match self.open(id) {
            Ok(reader) => reader,
            Err(Error::CorruptObjectMessage(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut hasher = ObjectHasher::new();
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => hasher.update(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Ok(false),
            }
        }
        Ok(hasher.len() == reader.size() && hasher.finalize() == *id)
    }

    /// delete an object, returning the on-disk bytes freed
    pub fn remove(&self, id: &ObjectId) -> Result<u64> {
        let path = self.path_of(id);
        let size = self.disk_size(id)?;
        fs::remove_file(&path).map_err(|e| not_found_or_io(e, id, &path))?;
        debug!(object = %id, bytes = size, "removed object");
        Ok(size)
    }

    /// every object id present
    pub fn list(&self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        if !self.root.exists() {
            return Ok(ids);
        }

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| Error::Io {
                path: self.root.clone(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("walkdir error")),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let shard = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("");
            if let Ok(id) = ObjectId::from_hex(&format!("{}{}", shard, file_name)) {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// remove shard directories left empty after deletions
    pub fn remove_empty_shards(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.root).with_path(&self.root)? {
            let path = entry.with_path(&self.root)?.path();
            if path.is_dir() {
                // non-empty shards refuse removal, which is fine
                let _ = fs::remove_dir(&path);
            }
        }
        Ok(())
    }

    /// adopt an object file from another database without re-encoding
    ///
    /// hardlinks when both live on the same filesystem, copies otherwise.
    pub fn import_raw(&self, src: &ObjectDb, id: &ObjectId) -> Result<CopyMode> {
        let dst_path = self.path_of(id);
        if dst_path.is_file() {
            return Ok(CopyMode::Skipped);
        }
        let src_path = src.path_of(id);
        if !src_path.is_file() {
            return Err(Error::ObjectNotFound(*id));
        }

        let shard = dst_path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&shard).with_path(&shard)?;

        match fs::hard_link(&src_path, &dst_path) {
            Ok(()) => {
                fsync_dir(&shard)?;
                return Ok(CopyMode::Hardlinked);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(CopyMode::Skipped),
            Err(_) => {}
        }

        let tmp_path = self.tmp_file();
        let result = (|| {
            fs::copy(&src_path, &tmp_path).with_path(&src_path)?;
            File::open(&tmp_path)
                .and_then(|f| f.sync_all())
                .with_path(&tmp_path)?;
            fs::rename(&tmp_path, &dst_path).with_path(&dst_path)?;
            fsync_dir(&shard)
        })();
        discard_tmp(&tmp_path, result).map(|()| CopyMode::Copied)
    }
}

/// streaming reader over a stored object's content
pub struct ObjectReader {
    decoder: zstd::stream::read::Decoder<'static, BufReader<File>>,
    size: u64,
}

impl ObjectReader {
    /// uncompressed content size
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoder.read(buf)
    }
}

fn read_header(file: &mut File, id: &ObjectId) -> Result<u64> {
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|e| Error::CorruptObjectMessage(format!("{}: unreadable header: {}", id, e)))?;
    Ok(u64::from_le_bytes(header))
}

fn not_found_or_io(e: io::Error, id: &ObjectId, path: &Path) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::ObjectNotFound(*id)
    } else {
        Error::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

/// drop a temp file when the write that produced it failed
fn discard_tmp(tmp_path: &Path, result: Result<()>) -> Result<()> {
    if result.is_err() {
        let _ = fs::remove_file(tmp_path);
    }
    result
}

/// fsync a directory
pub(crate) fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_db() -> (tempfile::TempDir, ObjectDb) {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("objects")).unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        let db = ObjectDb::new(dir.path().join("objects"), dir.path().join("tmp"));
        (dir, db)
    }

    #[test]
    fn test_write_and_read() {
        let (_dir, db) = test_db();
        let id = db.write(b"hello, world!", None).unwrap();
        assert_eq!(id, ObjectId::of(b"hello, world!"));
        assert!(db.contains(&id));
        assert_eq!(db.read(&id).unwrap(), b"hello, world!");
        assert_eq!(db.size(&id).unwrap(), 13);
    }

    #[test]
    fn test_streaming_matches_buffered() {
        let (_dir, db) = test_db();
        let content = vec![7u8; 200 * 1024];
        let streamed = db.write_streaming(&mut &content[..], None).unwrap();
        assert_eq!(streamed, ObjectId::of(&content));
        assert_eq!(db.size(&streamed).unwrap(), content.len() as u64);
        assert_eq!(db.read(&streamed).unwrap(), content);
        assert!(db.verify(&streamed).unwrap());
    }

    #[test]
    fn test_deduplication() {
        let (_dir, db) = test_db();
        let a = db.write(b"same", None).unwrap();
        let b = db.write_streaming(&mut &b"same"[..], None).unwrap();
        assert_eq!(a, b);
        assert_eq!(db.list().unwrap(), vec![a]);
    }

    #[test]
    fn test_shared_db_prevents_local_write() {
        let (_dir, local) = test_db();
        let (_pdir, pool) = test_db();
        let id = pool.write(b"pooled", None).unwrap();
        assert_eq!(local.write(b"pooled", Some(&pool)).unwrap(), id);
        assert!(!local.contains(&id));
    }

    #[test]
    fn test_sharded_layout() {
        let (_dir, db) = test_db();
        let id = db.write(b"test", None).unwrap();
        let hex = id.to_hex();
        assert!(db
            .path_of(&id)
            .ends_with(format!("{}/{}", &hex[..2], &hex[2..])));
    }

    #[test]
    fn test_missing_object() {
        let (_dir, db) = test_db();
        let id = ObjectId::of(b"nope");
        assert!(matches!(db.read(&id), Err(Error::ObjectNotFound(_))));
        assert!(matches!(db.size(&id), Err(Error::ObjectNotFound(_))));
        assert!(matches!(db.verify(&id), Err(Error::ObjectNotFound(_))));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (_dir, db) = test_db();
        let id = db.write(b"original", None).unwrap();
        let other = db.write(b"tampered", None).unwrap();
        // overwrite with another valid object's bytes
        fs::copy(db.path_of(&other), db.path_of(&id)).unwrap();
        assert!(!db.verify(&id).unwrap());

        fs::write(db.path_of(&other), b"garbage").unwrap();
        assert!(!db.verify(&other).unwrap());
    }

    #[test]
    fn test_read_rejects_lying_header() {
        let (_dir, db) = test_db();
        let id = db.write(b"short", None).unwrap();
        let path = db.path_of(&id);
        let mut bytes = fs::read(&path).unwrap();
        bytes[..HEADER_LEN].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        assert!(matches!(db.read(&id), Err(Error::CorruptObjectMessage(_))));
        assert!(!db.verify(&id).unwrap());
    }

    #[test]
    fn test_remove_and_list() {
        let (_dir, db) = test_db();
        let a = db.write(b"a", None).unwrap();
        let b = db.write(b"b", None).unwrap();
        assert!(db.remove(&a).unwrap() > 0);
        assert_eq!(db.list().unwrap(), vec![b]);
        assert!(matches!(db.remove(&a), Err(Error::ObjectNotFound(_))));
    }

    #[test]
    fn test_import_raw() {
        let (_dir, src) = test_db();
        let (_ddir, dst) = test_db();
        let id = src.write(b"payload", None).unwrap();

        let mode = dst.import_raw(&src, &id).unwrap();
        assert_ne!(mode, CopyMode::Skipped);
        assert_eq!(dst.read(&id).unwrap(), b"payload");
        assert_eq!(dst.import_raw(&src, &id).unwrap(), CopyMode::Skipped);
    }

    #[test]
    fn test_no_tmp_leftovers() {
        let (dir, db) = test_db();
        db.write(b"x", None).unwrap();
        db.write_streaming(&mut &b"x"[..], None).unwrap();
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }
}
