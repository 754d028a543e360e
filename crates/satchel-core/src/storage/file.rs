//! Host-filesystem storage backend.

use super::{
    ensure_payload, key_components, Backend, BoxFuture, StorageError, StorageResult,
};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Filesystem-tree backend for native platforms.
///
/// Keys map to files under a base directory, one path component per key
/// segment (`assets/abc.png` becomes `<base>/assets/abc.png`).
pub struct FileBackend {
    /// Base directory for all stored blobs.
    base_path: PathBuf,
}

impl FileBackend {
    /// Create a new file backend rooted at `base_path`.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self { base_path })
    }

    /// Resolve the on-disk path for a key.
    fn blob_path(&self, key: &str) -> StorageResult<PathBuf> {
        let mut path = self.base_path.clone();
        for part in key_components(key)? {
            path.push(sanitize_component(part));
        }
        Ok(path)
    }

    /// Get the base path.
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn walk(&self, dir: &PathBuf, prefix: &str, out: &mut Vec<String>) -> StorageResult<()> {
        let entries = fs::read_dir(dir).map_err(|e| {
            StorageError::Io(format!("Failed to read directory: {}", e))
        })?;
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, &key, out)?;
            } else {
                out.push(key);
            }
        }
        Ok(())
    }
}

/// Sanitize one key segment to be safe as a file name.
fn sanitize_component(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl Backend for FileBackend {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>> {
        let path = self.blob_path(key);
        Box::pin(async move {
            let path = path?;
            match fs::read(&path) {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StorageError::Io(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                ))),
            }
        })
    }

    fn set(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        let path = self.blob_path(&key);
        Box::pin(async move {
            ensure_payload(&key, &data)?;
            let path = path?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Io(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
            fs::write(&path, data).map_err(|e| {
                StorageError::Io(format!("Failed to write {}: {}", path.display(), e))
            })
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.blob_path(key);
        Box::pin(async move {
            let path = path?;
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io(format!(
                    "Failed to delete {}: {}",
                    path.display(),
                    e
                ))),
            }
        })
    }

    fn list(&self, dir: &str) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let path = self.blob_path(dir);
        Box::pin(async move {
            let path = path?;
            if !path.exists() {
                return Ok(vec![]);
            }
            let entries = fs::read_dir(&path).map_err(|e| {
                StorageError::Io(format!("Failed to read directory: {}", e))
            })?;
            let mut names = Vec::new();
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
            names.sort();
            Ok(names)
        })
    }

    fn keys(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move {
            if !self.base_path.exists() {
                return Ok(vec![]);
            }
            let mut keys = Vec::new();
            self.walk(&self.base_path.clone(), "", &mut keys)?;
            keys.sort();
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf()).unwrap();

        backend
            .set("database/database.bin", vec![9, 8, 7])
            .await
            .unwrap();
        let data = backend.get("database/database.bin").await.unwrap();
        assert_eq!(data, Some(vec![9, 8, 7]));
    }

    #[tokio::test]
    async fn test_missing_is_none() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(backend.get("assets/nope.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_and_keys() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf()).unwrap();

        backend.set("assets/a.png", vec![1]).await.unwrap();
        backend.set("assets/b.png", vec![2]).await.unwrap();
        backend.set("database/database.bin", vec![3]).await.unwrap();

        assert_eq!(backend.list("assets").await.unwrap(), vec!["a.png", "b.png"]);
        assert_eq!(
            backend.keys().await.unwrap(),
            vec!["assets/a.png", "assets/b.png", "database/database.bin"]
        );
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf()).unwrap();
        assert!(backend.list("assets").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf()).unwrap();
        let result = backend.set("../escape.bin", vec![1]).await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf()).unwrap();

        backend.set("assets/a.png", vec![1]).await.unwrap();
        backend.delete("assets/a.png").await.unwrap();
        assert_eq!(backend.get("assets/a.png").await.unwrap(), None);
    }
}
