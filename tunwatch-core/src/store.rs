//! Persisted key-value preferences
//!
//! The engine persists exactly one value (the preferred protocol), but the
//! store is a plain string key-value contract so the surrounding application
//! can back it with whatever durable storage it already has.

use crate::error::StoreError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Durable string key-value storage
pub trait PreferenceStore: Send + Sync {
    /// Read a value; `Ok(None)` when the key is absent
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write (or overwrite) a value
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key; removing an absent key is not an error
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Volatile store for tests and for callers without persistence
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// TOML file backed store
///
/// The whole file is a flat table of strings. Writes go to a sibling
/// temporary file which is then renamed over the original.
#[derive(Debug)]
pub struct FilePreferenceStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_string(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(StoreError::ReadFailed {
                    path: self.path_string(),
                    message: e.to_string(),
                })
            }
        };

        toml::from_str(&contents).map_err(|e| StoreError::Corrupt {
            path: self.path_string(),
            message: e.to_string(),
        })
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let write_failed = |message: String| StoreError::WriteFailed {
            path: self.path_string(),
            message,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_failed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(values).map_err(|e| write_failed(e.to_string()))?;
        let tmp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, contents).map_err(|e| write_failed(e.to_string()))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| write_failed(e.to_string()))?;

        debug!(path = %self.path.display(), keys = values.len(), "Saved preference store");
        Ok(())
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(key))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.load()?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.load()?;
        if values.remove(key).is_some() {
            self.save(&values)?;
        }
        Ok(())
    }
}
