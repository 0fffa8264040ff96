//! Synchronous string key/value persistence.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::{StoreError, StoreResult};

/// Durable key/value collaborator.
///
/// Writes must be durable when `set` returns: a restart immediately after a
/// successful `set` observes the new value.
pub trait Storage: Send + Sync {
    /// Read a key. `Ok(None)` when absent.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a key.
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Delete a key. Deleting an absent key is not an error.
    fn remove(&self, key: &str) -> StoreResult<()>;
}

/// In-process storage. Counts writes so tests can observe coalescing.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, String>>,
    writes: AtomicU64,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Raw stored value, bypassing any mirror.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

/// One file per key under a directory; writes go through a temp file and
/// `rename` so a crash never leaves a torn value.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(dir.display().to_string(), e))?;
        Ok(Self { dir })
    }

    /// Storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", encode_key(key))))
    }
}

/// Keep `[A-Za-z0-9_-]`, percent-encode every other byte.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, value).map_err(|e| StoreError::io(key, e))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| StoreError::io(key, e))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_counts_writes() {
        let storage = MemoryStorage::new();
        storage.set("a", "1").unwrap();
        storage.set("a", "2").unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some("2"));
        assert_eq!(storage.write_count(), 2);
        storage.remove("a").unwrap();
        storage.remove("a").unwrap();
        assert_eq!(storage.get("a").unwrap(), None);
    }

    #[test]
    fn key_encoding_is_filesystem_safe() {
        assert_eq!(encode_key("sb_visitor_id_v1:visits"), "sb_visitor_id_v1%3Avisits");
        assert_eq!(encode_key("../etc"), "%2E%2E%2Fetc");
    }

    #[test]
    fn file_storage_rejects_empty_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        assert!(matches!(
            storage.set("", "x"),
            Err(StoreError::InvalidKey(_))
        ));
    }
}
