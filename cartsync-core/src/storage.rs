//! Durable key-value storage primitive.
//!
//! The buffer persists through the [`KeyValueStore`] trait, which mirrors the
//! browser's asynchronous key-value storage: `get`, `update` (read-modify-write
//! through an updater closure) and `delete`, each scoped to a single key.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`] keeps documents in process memory.
//! - [`FileStore`] keeps one JSON document per key in a data directory and
//!   commits each write with a temp-file rename under an advisory file lock,
//!   so readers never observe a half-written document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncError;

/// Read-modify-write closure passed to [`KeyValueStore::update`].
///
/// Receives the current value (or `None` if the key is absent) and returns
/// the value to commit.
pub type Updater = Box<dyn FnOnce(Option<Value>) -> Value + Send>;

/// Errors that can occur in the storage primitive.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Storage is disabled or over quota.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    /// An I/O error occurred during persistence.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::StorageUnavailable(e.to_string())
    }
}

/// Asynchronous key-value persistence.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Atomically replace the value under `key` with `updater(current)`.
    ///
    /// Returns the committed value.
    async fn update(&self, key: &str, updater: Updater) -> Result<Value, StorageError>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process store.
///
/// Clones share the same underlying map, so a "reload" can be simulated by
/// building a new buffer over a clone of the same store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Value>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Enable or disable the store. A disabled store fails every call with
    /// [`StorageError::Unavailable`], like browser storage that is turned off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("storage disabled".into()))
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.check_available()?;
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn update(&self, key: &str, updater: Updater) -> Result<Value, StorageError> {
        self.check_available()?;
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let next = updater(entries.get(key).cloned());
        entries.insert(key.to_string(), next.clone());
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Filesystem-backed store: one JSON file per key.
///
/// Writers on the same key are serialized by an advisory lock on a
/// `<key>.json.lock` file next to the document, so separate handles and
/// separate processes sharing one data directory never lose each other's
/// commits. Each commit writes a uniquely named temp file and renames it
/// into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    /// The directory holding the documents.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", sanitize_key(key)))
    }

    async fn read_value(path: &Path) -> Result<Option<Value>, StorageError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => parse_document(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Run `op` on a blocking thread while holding the key's write lock.
    async fn with_write_lock<T, F>(&self, key: &str, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StorageError> + Send + 'static,
    {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || {
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path.with_extension("json.lock"))?;
            let mut lock = fd_lock::RwLock::new(lock_file);
            let _guard = lock.write()?;
            op(&path)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("storage task failed: {e}")))?
    }
}

fn parse_document(contents: &str) -> Result<Value, StorageError> {
    serde_json::from_str(contents).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn read_document(path: &Path) -> Result<Option<Value>, StorageError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_document(&contents).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

fn commit_document(path: &Path, value: &Value) -> Result<(), StorageError> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, json)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(StorageError::Io(e));
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Self::read_value(&self.path_for(key)).await
    }

    async fn update(&self, key: &str, updater: Updater) -> Result<Value, StorageError> {
        self.with_write_lock(key, move |path| {
            let next = updater(read_document(path)?);
            commit_document(path, &next)?;
            Ok(next)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.with_write_lock(key, |path| match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        })
        .await
    }
}

/// Sanitize a storage key for use as a filename.
///
/// Replaces any character that is not alphanumeric, `-`, or `_` with `_`.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
