//! serialized write sessions
//!
//! at most one transaction is open per store: threads of this process queue
//! on a mutex + condvar, other processes on an exclusive flock of `.lock`.
//! every open transaction owns a journal file under `txn/`; a journal that
//! survives its process marks an interrupted transaction for fsck.

use std::fs::{self, File};
use std::io::Write;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::ops::{self, Operation, Outcome};
use crate::store::Store;

/// journal file suffix under `txn/`
pub(crate) const JOURNAL_SUFFIX: &str = ".journal";

/// per-store writer slot
#[derive(Default)]
pub(crate) struct TxnManager {
    busy: Mutex<bool>,
    released: Condvar,
}

impl TxnManager {
    fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.released.wait(&mut busy);
        }
        *busy = true;
    }

    fn try_acquire(&self) -> bool {
        let mut busy = self.busy.lock();
        if *busy {
            return false;
        }
        *busy = true;
        true
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.released.notify_one();
    }
}

struct TxnState {
    id: String,
    store: PathBuf,
    open: AtomicBool,
    writes: AtomicU64,
}

/// cloneable handle for writing inside a transaction from any thread
#[derive(Clone)]
pub struct TxnHandle {
    state: Arc<TxnState>,
}

impl TxnHandle {
    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn is_active(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    /// objects and records written so far
    pub fn writes(&self) -> u64 {
        self.state.writes.load(Ordering::Relaxed)
    }

    /// fail unless this handle may write to `store` right now
    pub(crate) fn check(&self, store: &Store) -> Result<()> {
        if !self.is_active() {
            return Err(Error::IllegalState(format!(
                "transaction {} has ended",
                self.state.id
            )));
        }
        if self.state.store != store.path() {
            return Err(Error::IllegalState(format!(
                "transaction {} belongs to {}",
                self.state.id,
                self.state.store.display()
            )));
        }
        Ok(())
    }

    pub(crate) fn record_write(&self) {
        self.state.writes.fetch_add(1, Ordering::Relaxed);
    }
}

/// guard for an open transaction; commit or drop to release the store
pub struct Transaction<'a> {
    store: &'a Store,
    handle: TxnHandle,
    journal: PathBuf,
    lock: Option<Flock<File>>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    /// block until the store's writer slot is free, then open a transaction
    pub(crate) fn begin(store: &'a Store) -> Result<Self> {
        store.txns().acquire();
        Self::open(store, FlockArg::LockExclusive)
    }

    /// open a transaction only if no other writer holds the store
    pub(crate) fn try_begin(store: &'a Store) -> Result<Self> {
        if !store.txns().try_acquire() {
            return Err(Error::StoreBusy(store.path().to_path_buf()));
        }
        Self::open(store, FlockArg::LockExclusiveNonblock)
    }

    /// the writer slot is held; take the file lock and write the journal
    fn open(store: &'a Store, mode: FlockArg) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let journal = store.txn_path().join(format!("{}{}", id, JOURNAL_SUFFIX));

        let lock = match lock_and_journal(store, &journal, &id, mode) {
            Ok(lock) => lock,
            Err(e) => {
                store.txns().release();
                return Err(e);
            }
        };

        debug!(txn = %id, store = %store.path().display(), "transaction started");
        Ok(Self {
            store,
            handle: TxnHandle {
                state: Arc::new(TxnState {
                    id,
                    store: store.path().to_path_buf(),
                    open: AtomicBool::new(true),
                    writes: AtomicU64::new(0),
                }),
            },
            journal,
            lock: Some(lock),
            finished: false,
        })
    }

    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn handle(&self) -> &TxnHandle {
        &self.handle
    }

    /// a handle that worker threads can carry
    pub fn detach(&self) -> TxnHandle {
        self.handle.clone()
    }

    /// run an operation inside this transaction
    pub fn execute(&self, op: Operation) -> Result<Outcome> {
        ops::execute_in(self.store, Some(&self.handle), op)
    }

    /// end the transaction; written data stays
    pub fn commit(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.handle.state.open.store(false, Ordering::Release);

        let removed = match fs::remove_file(&self.journal) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e).with_path(&self.journal),
            _ => Ok(()),
        };
        self.lock.take();
        self.store.txns().release();
        debug!(txn = %self.handle.id(), writes = self.handle.writes(), "transaction ended");
        removed
    }
}

impl Deref for Transaction<'_> {
    type Target = TxnHandle;

    fn deref(&self) -> &TxnHandle {
        &self.handle
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

fn lock_and_journal(
    store: &Store,
    journal: &PathBuf,
    id: &str,
    mode: FlockArg,
) -> Result<Flock<File>> {
    let lock_path = store.lock_path();
    let file = File::create(&lock_path).with_path(&lock_path)?;
    let lock = Flock::lock(file, mode).map_err(|(_, errno)| {
        if errno == Errno::EWOULDBLOCK {
            Error::StoreBusy(store.path().to_path_buf())
        } else {
            Error::Io {
                path: lock_path.clone(),
                source: errno.into(),
            }
        }
    })?;

    let mut file = File::create(journal).with_path(journal)?;
    writeln!(file, "txn {} pid {}", id, std::process::id()).with_path(journal)?;
    file.sync_all().with_path(journal)?;
    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::init(&dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn journal_count(store: &Store) -> usize {
        fs::read_dir(store.txn_path()).unwrap().count()
    }

    #[test]
    fn test_journal_lifecycle() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        assert_eq!(journal_count(&store), 1);
        txn.commit().unwrap();
        assert_eq!(journal_count(&store), 0);

        let txn = store.begin().unwrap();
        drop(txn);
        assert_eq!(journal_count(&store), 0);
    }

    #[test]
    fn test_handle_rejected_after_commit() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        let handle = txn.detach();
        store.put(&handle, b"inside").unwrap();
        txn.commit().unwrap();

        assert!(!handle.is_active());
        assert!(matches!(
            store.put(&handle, b"after"),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_handle_rejected_by_other_store() {
        let (_dir, store) = test_store();
        let (_dir2, other) = test_store();
        let txn = store.begin().unwrap();
        assert!(matches!(other.put(&txn, b"x"), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_writers_are_serialized() {
        let (_dir, store) = test_store();
        let inside = AtomicUsize::new(0);
        let overlap = AtomicBool::new(false);

        std::thread::scope(|s| {
            for i in 0..4 {
                let (store, inside, overlap) = (&store, &inside, &overlap);
                s.spawn(move || {
                    let txn = store.begin().unwrap();
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    store.put(&txn, format!("thread {}", i).as_bytes()).unwrap();
                    std::thread::sleep(Duration::from_millis(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    txn.commit().unwrap();
                });
            }
        });

        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(journal_count(&store), 0);
    }

    #[test]
    fn test_worker_threads_share_handle() {
        let (_dir, store) = test_store();
        let txn = store.begin().unwrap();
        let handle = txn.detach();

        std::thread::scope(|s| {
            for i in 0..3 {
                let (store, handle) = (&store, handle.clone());
                s.spawn(move || store.put(&handle, format!("w{}", i).as_bytes()).unwrap());
            }
        });

        assert_eq!(txn.writes(), 3);
        txn.commit().unwrap();
    }

    #[test]
    fn test_try_begin_refuses_busy_store() {
        let (dir, store) = test_store();
        let txn = store.begin().unwrap();
        assert!(matches!(store.try_begin(), Err(Error::StoreBusy(_))));

        // a second handle on the same path meets the file lock
        let second = Store::open(&dir.path().join("store")).unwrap();
        assert!(matches!(second.try_begin(), Err(Error::StoreBusy(_))));
        assert_eq!(journal_count(&store), 1);

        txn.commit().unwrap();
        second.try_begin().unwrap().commit().unwrap();
    }
}
