//! In-memory storage implementation.

use super::{ensure_payload, Backend, BoxFuture, StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory backend for testing and ephemeral use.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether the backend holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>> {
        let key = key.to_string();
        Box::pin(async move {
            let entries = self.entries.read().map_err(|e| {
                StorageError::Other(format!("Lock error: {}", e))
            })?;
            Ok(entries.get(&key).cloned())
        })
    }

    fn set(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            ensure_payload(&key, &data)?;
            let mut entries = self.entries.write().map_err(|e| {
                StorageError::Other(format!("Lock error: {}", e))
            })?;
            entries.insert(key, data);
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.write().map_err(|e| {
                StorageError::Other(format!("Lock error: {}", e))
            })?;
            entries.remove(&key);
            Ok(())
        })
    }

    fn list(&self, dir: &str) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Box::pin(async move {
            let entries = self.entries.read().map_err(|e| {
                StorageError::Other(format!("Lock error: {}", e))
            })?;
            let mut names: Vec<String> = entries
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .filter(|rest| !rest.contains('/'))
                .map(|rest| rest.to_string())
                .collect();
            names.sort();
            Ok(names)
        })
    }

    fn keys(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let entries = self.entries.read().map_err(|e| {
                StorageError::Other(format!("Lock error: {}", e))
            })?;
            let mut keys: Vec<String> = entries.keys().cloned().collect();
            keys.sort();
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let backend = MemoryBackend::new();
        backend.set("assets/a.png", vec![1, 2, 3]).await.unwrap();
        assert_eq!(backend.get("assets/a.png").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_empty_payload_rejected() {
        let backend = MemoryBackend::new();
        let result = backend.set("assets/a.png", vec![]).await;
        assert!(matches!(result, Err(StorageError::EmptyPayload(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.set("k", vec![1]).await.unwrap();
        backend.delete("k").await.unwrap();
        backend.delete("k").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_returns_basenames() {
        let backend = MemoryBackend::new();
        backend.set("assets/a.png", vec![1]).await.unwrap();
        backend.set("assets/b.png", vec![2]).await.unwrap();
        backend.set("database/database.bin", vec![3]).await.unwrap();

        let names = backend.list("assets").await.unwrap();
        assert_eq!(names, vec!["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn test_keys_returns_full_paths() {
        let backend = MemoryBackend::new();
        backend.set("assets/a.png", vec![1]).await.unwrap();
        backend.set("database/database.bin", vec![2]).await.unwrap();

        let keys = backend.keys().await.unwrap();
        assert_eq!(keys, vec!["assets/a.png", "database/database.bin"]);
    }
}
