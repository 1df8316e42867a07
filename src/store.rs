//! The persisted-state contract (spec §1, §3, §6): defined here only by the
//! key/value and atomic-file interfaces the core consumes. Real durable
//! storage is an external collaborator; this module provides the trait plus
//! two usable implementations (in-memory, for tests; atomic-file-backed, for
//! a real deployment that doesn't need RocksDB-grade throughput).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store: key contains invalid characters: {0}")]
    InvalidKey(String),
}

/// Async key/value contract. Every successful `put` must be durable before
/// it returns (spec §8: "every successful Prefs mutation is durable").
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Reference in-memory store, used by tests and by `simulation-mode`-style
/// runs that don't want real disk I/O.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.write().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One file per key under `root`, written via write-to-temp + `rename` so a
/// reader never observes a torn write (spec §5: "writes are atomic-file or
/// atomic-KV").
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Keys may be namespaced with `/` (e.g. `control/auth-token`), each
    /// segment becoming a subdirectory; `..` segments and nul bytes are
    /// rejected to keep every resolved path under `root`.
    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.contains('\0') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = tmp_path_for(&path);
        {
            let mut f = tokio::fs::File::create(&tmp_path).await?;
            f.write_all(value).await?;
            f.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// A lock-mediated publisher for [`crate::types::Prefs`] matching spec §5:
/// "mutations acquire a short lock, mutate, persist, release; subscribers
/// receive an immutable snapshot."
pub struct PrefsStore {
    store: Arc<dyn KvStore>,
    key: String,
    current: Arc<RwLock<Arc<crate::types::Prefs>>>,
}

impl PrefsStore {
    pub async fn load(store: Arc<dyn KvStore>, profile_key: &str) -> Result<Self, StoreError> {
        let key = format!("profile-{profile_key}");
        let prefs = match store.get(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            None => crate::types::Prefs::default(),
        };
        Ok(Self { store, key, current: Arc::new(RwLock::new(Arc::new(prefs))) })
    }

    pub fn snapshot(&self) -> Arc<crate::types::Prefs> {
        self.current.read().clone()
    }

    /// Applies `mutate`, persists the result, then publishes it. Returns the
    /// new snapshot.
    pub async fn mutate(
        &self,
        mutate: impl FnOnce(&mut crate::types::Prefs),
    ) -> Result<Arc<crate::types::Prefs>, StoreError> {
        let mut next = (*self.snapshot()).clone();
        mutate(&mut next);
        let bytes = serde_json::to_vec(&next).expect("Prefs serializes");
        self.store.put(&self.key, &bytes).await?;
        let next = Arc::new(next);
        *self.current.write() = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryStore::new();
        store.put("a", b"1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.put("k", b"v").await.unwrap();
        }
        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn file_store_rejects_path_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(matches!(store.get("../etc/passwd").await, Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.get("a/../../etc/passwd").await, Err(StoreError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn file_store_namespaces_keys_into_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.put("control/auth-token", b"tok").await.unwrap();
        assert_eq!(store.get("control/auth-token").await.unwrap(), Some(b"tok".to_vec()));
        store.delete("control/auth-token").await.unwrap();
        assert_eq!(store.get("control/auth-token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefs_store_mutation_is_durable_across_reload() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let prefs = PrefsStore::load(store.clone(), "p1").await.unwrap();
        prefs.mutate(|p| p.want_running = true).await.unwrap();

        let reloaded = PrefsStore::load(store.clone(), "p1").await.unwrap();
        assert!(reloaded.snapshot().want_running);
    }
}
