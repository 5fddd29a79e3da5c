//! Record store, the persistence collaborator.
//! Holds opaque JSON values and append-only historical records.
//! No schema logic lives here: callers decide what a record means.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, TaskbusError};

/// Storage for configuration values and historical records.
pub trait RecordStore: Send + Sync {
    /// Append a record to the collection named `kind`.
    fn append(&self, kind: &str, record: Value) -> Result<()>;
    /// Load every record of `kind`, oldest first.
    fn load(&self, kind: &str) -> Result<Vec<Value>>;
    /// Read a configuration value.
    fn get_value(&self, key: &str) -> Result<Option<Value>>;
    /// Write a configuration value.
    fn set_value(&self, key: &str, value: Value) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, Vec<Value>>,
    values: HashMap<String, Value>,
}

/// In-process store, used by tests and when no data dir is configured.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("MemoryStore mutex poisoned (recovering)");
            poisoned.into_inner()
        })
    }
}

impl RecordStore for MemoryStore {
    fn append(&self, kind: &str, record: Value) -> Result<()> {
        self.lock().records.entry(kind.to_string()).or_default().push(record);
        Ok(())
    }

    fn load(&self, kind: &str) -> Result<Vec<Value>> {
        Ok(self.lock().records.get(kind).cloned().unwrap_or_default())
    }

    fn get_value(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock().values.get(key).cloned())
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        self.lock().values.insert(key.to_string(), value);
        Ok(())
    }
}

/// File-based store: one pretty-printed JSON array per record kind,
/// plus `values.json` for configuration values.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the same directory.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store rooted at `dir`, creating it if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn kind_file(&self, kind: &str) -> Result<PathBuf> {
        if kind.is_empty()
            || !kind
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(TaskbusError::Store(format!("invalid record kind '{kind}'")));
        }
        Ok(self.path.join(format!("{kind}.json")))
    }

    fn read_json<T: serde::de::DeserializeOwned + Default>(file: &Path) -> Result<T> {
        if !file.exists() {
            return Ok(T::default());
        }
        let json = std::fs::read_to_string(file)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn write_json<T: serde::Serialize>(file: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(file, json)?;
        tracing::debug!("💾 Saved {}", file.display());
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordStore for FileStore {
    fn append(&self, kind: &str, record: Value) -> Result<()> {
        let file = self.kind_file(kind)?;
        let _guard = self.guard();
        let mut records: Vec<Value> = Self::read_json(&file)?;
        records.push(record);
        Self::write_json(&file, &records)
    }

    fn load(&self, kind: &str) -> Result<Vec<Value>> {
        let file = self.kind_file(kind)?;
        let _guard = self.guard();
        Self::read_json(&file)
    }

    fn get_value(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.guard();
        let values: HashMap<String, Value> = Self::read_json(&self.path.join("values.json"))?;
        Ok(values.get(key).cloned())
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let file = self.path.join("values.json");
        let _guard = self.guard();
        let mut values: HashMap<String, Value> = Self::read_json(&file)?;
        values.insert(key.to_string(), value);
        Self::write_json(&file, &values)
    }
}
