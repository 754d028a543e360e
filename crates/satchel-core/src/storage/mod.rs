//! Storage abstraction for persistence.

mod file;
mod kv;
mod memory;
mod worker;

pub use file::FileBackend;
pub use kv::KvBackend;
pub use memory::MemoryBackend;
pub use worker::{WorkerBackend, WorkerChannel, WORKER_READY_TIMEOUT};

use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Canonical key of the live document snapshot.
pub const DATABASE_KEY: &str = "database/database.bin";

/// Directory holding the document and its timestamped backups.
pub const DATABASE_DIR: &str = "database";

/// Directory holding binary assets referenced by the document.
pub const ASSET_DIR: &str = "assets";

/// File-name prefix of timestamped document backups.
pub const BACKUP_PREFIX: &str = "dbbackup-";

/// Sentinel key recording that the one-time document migration ran.
pub const MIGRATION_FLAG_KEY: &str = "__db_migration_done__";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Refusing to write empty payload for {0}")]
    EmptyPayload(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Worker error: {0}")]
    Worker(String),
    #[error("Worker unavailable: {0}")]
    Unavailable(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Save file corrupted: {0}")]
    Corrupted(String),
    #[error("Storage error: {0}")]
    Other(String),
}

impl From<crate::codec::CodecError> for StorageError {
    fn from(err: crate::codec::CodecError) -> Self {
        StorageError::Codec(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future for async operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for byte-oriented storage backends.
///
/// Implementations can store blobs in memory, in a key-value database,
/// on the host filesystem, or behind the worker channel. Operations are
/// individually atomic per key; there are no multi-key transactions.
///
/// `get` of a missing key resolves to `Ok(None)` — absence is a normal
/// outcome, not an error. `set` of an empty payload fails with
/// [`StorageError::EmptyPayload`].
pub trait Backend: Send + Sync {
    /// Read the blob stored under `key`.
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>>;

    /// Store `data` under `key`, replacing any previous value.
    fn set(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>>;

    /// Remove the blob under `key`. Deleting a missing key is a no-op.
    fn delete(&self, key: &str) -> BoxFuture<'_, StorageResult<()>>;

    /// List entry basenames directly under `dir` (non-recursive).
    fn list(&self, dir: &str) -> BoxFuture<'_, StorageResult<Vec<String>>>;

    /// List every stored key, as full `dir/name` paths.
    fn keys(&self) -> BoxFuture<'_, StorageResult<Vec<String>>>;
}

/// Build the storage key of a timestamped backup.
pub fn backup_key(stamp: u64) -> String {
    format!("{DATABASE_DIR}/{BACKUP_PREFIX}{stamp}.bin")
}

/// Parse the timestamp out of a `dbbackup-<stamp>.bin` file name.
pub fn backup_stamp(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(BACKUP_PREFIX)?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

/// Whether `key` names a timestamped backup record.
pub fn is_backup_key(key: &str) -> bool {
    key.strip_prefix(DATABASE_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(backup_stamp)
        .is_some()
}

/// Last path segment of a key, treating both separators as dividers.
pub fn basename(key: &str) -> &str {
    key.rsplit(['/', '\\']).next().unwrap_or(key)
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn ensure_payload(key: &str, data: &[u8]) -> StorageResult<()> {
    if data.is_empty() {
        return Err(StorageError::EmptyPayload(key.to_string()));
    }
    Ok(())
}

/// Split a key into validated path components.
///
/// Rejects empty components and dot traversal so a key can never escape
/// a backend's base directory.
pub(crate) fn key_components(key: &str) -> StorageResult<Vec<&str>> {
    let parts: Vec<&str> = key.split(['/', '\\']).collect();
    if parts
        .iter()
        .any(|p| p.is_empty() || *p == "." || *p == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(parts)
}
