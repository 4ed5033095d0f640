//! Durable FIFO store for log entries awaiting delivery.
//!
//! When a target is configured with a queue directory, entries are persisted
//! here instead of the in-memory channel and replayed until the remote
//! acknowledges them. Keys are opaque to callers; per-entry success is
//! observable only through deletion.

use std::{
    fs,
    io::ErrorKind,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Errors produced by entry stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The remote endpoint is unreachable; the entry stays in the store and
    /// the replay loop backs off. This is a signal value, not a store fault.
    #[error("remote endpoint is not connected")]
    NotConnected,

    /// The store holds its configured maximum number of entries.
    #[error("queue store is full ({limit} entries)")]
    Full {
        /// Configured entry limit.
        limit: u64,
    },

    /// No entry exists under the given key.
    #[error("no entry stored under key {key}")]
    NotFound {
        /// Key that was requested.
        key: String,
    },

    /// Underlying filesystem failure.
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be serialized or deserialized.
    #[error("store serialization failed: {0}")]
    Serialization(String),
}

/// Durable keyed FIFO holding serialized entries.
///
/// Implementations must be safe to share between the producer side (`put`)
/// and the replay loop (`list`/`get`/`del`).
pub trait EntryStore<E>: Send + Sync {
    /// Opens the store, creating backing state as needed. Must be called
    /// before any other operation.
    fn open(&self) -> Result<(), StoreError>;

    /// Persists an entry and returns its key.
    fn put(&self, entry: &E) -> Result<String, StoreError>;

    /// Reads the entry stored under `key`.
    fn get(&self, key: &str) -> Result<E, StoreError>;

    /// Removes the entry stored under `key`.
    fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Lists stored keys in insertion order.
    fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Number of entries currently stored.
    fn len(&self) -> usize;

    /// Whether the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// File-backed entry store: one JSON file per entry in a flat directory.
///
/// Keys are zero-padded monotonic sequence numbers, so lexical order is
/// insertion order and the sequence survives restarts (`open` rescans the
/// directory and resumes past the highest existing key).
pub struct DirStore<E> {
    dir: PathBuf,
    ext: String,
    limit: u64,
    seq: AtomicU64,
    entries: Mutex<u64>,
    _marker: PhantomData<fn(E) -> E>,
}

impl<E> DirStore<E> {
    /// Creates a store rooted at `dir`, holding at most `limit` entries,
    /// naming files with `ext` (for example `.http.log`).
    pub fn new(dir: impl Into<PathBuf>, limit: u64, ext: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            ext: ext.into(),
            limit,
            seq: AtomicU64::new(0),
            entries: Mutex::new(0),
            _marker: PhantomData,
        }
    }

    /// Directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}{}", self.ext))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let key = name.strip_suffix(&self.ext)?;
        if key.is_empty() {
            return None;
        }
        Some(key.to_string())
    }

    fn scan(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if let Some(key) = self.key_of(&path) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, u64> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<E> EntryStore<E> for DirStore<E>
where
    E: Serialize + DeserializeOwned + Send + Sync,
{
    fn open(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let keys = self.scan()?;
        let next_seq = keys
            .iter()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1);

        self.seq.store(next_seq, Ordering::SeqCst);
        *self.lock_entries() = keys.len() as u64;
        Ok(())
    }

    fn put(&self, entry: &E) -> Result<String, StoreError> {
        let data = serde_json::to_vec(entry).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut entries = self.lock_entries();
        if *entries >= self.limit {
            return Err(StoreError::Full { limit: self.limit });
        }

        let key = format!("{:020}", self.seq.fetch_add(1, Ordering::SeqCst));
        fs::write(self.path_for(&key), data)?;
        *entries += 1;
        Ok(key)
    }

    fn get(&self, key: &str) -> Result<E, StoreError> {
        let data = fs::read(self.path_for(key)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::NotFound { key: key.to_string() }
            } else {
                StoreError::Io(e)
            }
        })?;
        serde_json::from_slice(&data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.lock_entries();
        fs::remove_file(self.path_for(key)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::NotFound { key: key.to_string() }
            } else {
                StoreError::Io(e)
            }
        })?;
        *entries = entries.saturating_sub(1);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        self.scan()
    }

    fn len(&self) -> usize {
        *self.lock_entries() as usize
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        seq: u32,
        body: String,
    }

    fn record(seq: u32) -> Record {
        Record { seq, body: format!("payload-{seq}") }
    }

    fn open_store(dir: &Path) -> DirStore<Record> {
        let store = DirStore::new(dir, 16, ".http.log");
        store.open().expect("store should open");
        store
    }

    #[test]
    fn entries_listed_in_insertion_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let k1 = store.put(&record(1)).unwrap();
        let k2 = store.put(&record(2)).unwrap();
        let k3 = store.put(&record(3)).unwrap();

        assert_eq!(store.list().unwrap(), vec![k1.clone(), k2, k3]);
        assert_eq!(store.get(&k1).unwrap(), record(1));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn delete_removes_file_and_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let key = store.put(&record(7)).unwrap();
        store.del(&key).unwrap();

        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.len(), 0);
        assert!(matches!(store.get(&key), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.del(&key), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn capacity_limit_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let store: DirStore<Record> = DirStore::new(tmp.path(), 2, ".http.log");
        store.open().unwrap();

        store.put(&record(1)).unwrap();
        store.put(&record(2)).unwrap();
        assert!(matches!(store.put(&record(3)), Err(StoreError::Full { limit: 2 })));

        // Deleting frees a slot.
        let keys = store.list().unwrap();
        store.del(&keys[0]).unwrap();
        store.put(&record(3)).unwrap();
    }

    #[test]
    fn reopen_resumes_sequence_after_restart() {
        let tmp = tempfile::tempdir().unwrap();

        let first = open_store(tmp.path());
        let k1 = first.put(&record(1)).unwrap();
        let k2 = first.put(&record(2)).unwrap();
        drop(first);

        let second = open_store(tmp.path());
        assert_eq!(second.len(), 2);
        let k3 = second.put(&record(3)).unwrap();

        // New keys sort after everything written before the restart.
        assert_eq!(second.list().unwrap(), vec![k1, k2, k3]);
    }

    #[test]
    fn foreign_files_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("notes.txt"), b"unrelated").unwrap();

        let store = open_store(tmp.path());
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.len(), 0);
    }
}
