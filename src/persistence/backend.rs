//! Persistence backends
//!
//! A backend stores opaque bytes by key. Writes are atomic: a reader sees
//! either the previous record or the new one, never a partial file.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::core::{OrchestratorError, OrchestratorResult};

/// Durable key/value store for snapshots
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Read a record, `None` if absent
    async fn read(&self, key: &str) -> OrchestratorResult<Option<Vec<u8>>>;

    /// Replace a record atomically
    async fn write(&self, key: &str, bytes: Vec<u8>) -> OrchestratorResult<()>;

    /// Remove a record, returning whether it existed
    async fn delete(&self, key: &str) -> OrchestratorResult<bool>;

    /// Every stored key
    async fn list_keys(&self) -> OrchestratorResult<Vec<String>>;
}

const SNAPSHOT_EXTENSION: &str = "json";

/// One JSON file per key under a directory
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Use `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> OrchestratorResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{SNAPSHOT_EXTENSION}"))
    }
}

#[async_trait]
impl PersistenceBackend for FileBackend {
    async fn read(&self, key: &str) -> OrchestratorResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> OrchestratorResult<()> {
        let dir = self.dir.clone();
        let path = self.path_for(key);
        // Temp file in the same directory so the rename stays on one filesystem
        tokio::task::spawn_blocking(move || -> OrchestratorResult<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| OrchestratorError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| OrchestratorError::other(format!("snapshot write task failed: {e}")))?
    }

    async fn delete(&self, key: &str) -> OrchestratorResult<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> OrchestratorResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-process backend, used when no state directory is configured
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn read(&self, key: &str) -> OrchestratorResult<Option<Vec<u8>>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> OrchestratorResult<()> {
        self.records.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> OrchestratorResult<bool> {
        Ok(self.records.write().remove(key).is_some())
    }

    async fn list_keys(&self) -> OrchestratorResult<Vec<String>> {
        let mut keys: Vec<String> = self.records.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_backend_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        assert!(backend.read("alice").await.unwrap().is_none());
        backend.write("alice", b"one".to_vec()).await.unwrap();
        backend.write("alice", b"two".to_vec()).await.unwrap();
        backend.write("bob", b"x".to_vec()).await.unwrap();

        assert_eq!(backend.read("alice").await.unwrap().unwrap(), b"two");
        assert_eq!(backend.list_keys().await.unwrap(), vec!["alice", "bob"]);

        assert!(backend.delete("alice").await.unwrap());
        assert!(!backend.delete("alice").await.unwrap());
        assert_eq!(backend.list_keys().await.unwrap(), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_file_backend_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        backend.write("alice", b"{}".to_vec()).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["alice.json"]);
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryBackend::new();
        backend.write("k", vec![1, 2]).await.unwrap();
        assert_eq!(backend.read("k").await.unwrap(), Some(vec![1, 2]));
        assert_eq!(backend.list_keys().await.unwrap(), vec!["k"]);
        assert!(backend.delete("k").await.unwrap());
        assert!(backend.read("k").await.unwrap().is_none());
    }
}
