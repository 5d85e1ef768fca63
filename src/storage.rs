//! Persistence providers.
//!
//! - [`FsStore`]: one file per key under a root directory
//! - [`MemoryStore`]: a map of keys to bytes, for tests and in-process runs

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::assim::errors::PersistenceError;
use crate::assim::traits::PersistenceProvider;

/// Stores every object as a file named by its key.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a new store rooted at `root`. The directory is created on the
    /// first write.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `key`.
    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn io(key: &str, e: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            key: key.to_string(),
            reason: e.to_string(),
        }
    }
}

impl PersistenceProvider for FsStore {
    fn exists(&self, key: &str) -> bool {
        self.path(key).is_file()
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, PersistenceError> {
        fs::read(self.path(key)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => PersistenceError::NotFound {
                key: key.to_string(),
            },
            _ => Self::io(key, e),
        })
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.root).map_err(|e| Self::io(key, e))?;
        // Write then rename so readers never see a partial object.
        let tmp = self.path(&format!(".{}.tmp", key));
        fs::write(&tmp, bytes).map_err(|e| Self::io(key, e))?;
        fs::rename(&tmp, self.path(key)).map_err(|e| Self::io(key, e))
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().map_or(0, |m| m.len())
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned(key: &str) -> PersistenceError {
        PersistenceError::Io {
            key: key.to_string(),
            reason: "store lock poisoned".to_string(),
        }
    }
}

impl PersistenceProvider for MemoryStore {
    fn exists(&self, key: &str) -> bool {
        self.objects.lock().map_or(false, |m| m.contains_key(key))
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, PersistenceError> {
        let objects = self.objects.lock().map_err(|_| Self::poisoned(key))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound {
                key: key.to_string(),
            })
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        let mut objects = self.objects.lock().map_err(|_| Self::poisoned(key))?;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}
