//! Key-value storage backend built on sled.

use super::{ensure_payload, Backend, BoxFuture, StorageError, StorageResult};
use std::path::Path;

/// Embedded key-value backend.
///
/// This is the asset store: many small-to-medium blobs addressed by flat
/// string keys, where per-write durability matters more than raw write
/// throughput.
pub struct KvBackend {
    db: sled::Db,
}

impl KvBackend {
    /// Open (or create) a key-value store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let config = sled::Config::new()
            .path(path.as_ref())
            .mode(sled::Mode::HighThroughput)
            .flush_every_ms(Some(1000));

        let db = config
            .open()
            .map_err(|e| StorageError::Io(format!("Failed to open kv store: {}", e)))?;
        Ok(Self { db })
    }

    fn map_err(e: sled::Error) -> StorageError {
        StorageError::Io(format!("kv store error: {}", e))
    }
}

impl Backend for KvBackend {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>> {
        let key = key.to_string();
        Box::pin(async move {
            let value = self.db.get(key.as_bytes()).map_err(Self::map_err)?;
            Ok(value.map(|v| v.to_vec()))
        })
    }

    fn set(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            ensure_payload(&key, &data)?;
            self.db
                .insert(key.as_bytes(), data)
                .map_err(Self::map_err)?;
            self.db.flush().map_err(Self::map_err)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.db.remove(key.as_bytes()).map_err(Self::map_err)?;
            self.db.flush().map_err(Self::map_err)?;
            Ok(())
        })
    }

    fn list(&self, dir: &str) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Box::pin(async move {
            let mut names = Vec::new();
            for item in self.db.scan_prefix(prefix.as_bytes()) {
                let (key, _) = item.map_err(Self::map_err)?;
                let Ok(key) = std::str::from_utf8(&key) else {
                    continue;
                };
                if let Some(rest) = key.strip_prefix(&prefix) {
                    if !rest.is_empty() && !rest.contains('/') {
                        names.push(rest.to_string());
                    }
                }
            }
            names.sort();
            Ok(names)
        })
    }

    fn keys(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            for item in self.db.iter() {
                let (key, _) = item.map_err(Self::map_err)?;
                if let Ok(key) = std::str::from_utf8(&key) {
                    keys.push(key.to_string());
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}
