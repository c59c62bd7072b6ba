//! Object Store Abstraction
//!
//! Minimal storage capability the pipeline writes through. Every failure is
//! classified as retryable (`Transient`, `Throttled`) or fatal (`Permanent`),
//! which is all the writer needs to decide between backoff and giving up.
//!
//! Implementations:
//! - `InMemoryObjectStore`: For unit tests and DST
//! - `LocalFsObjectStore`: For development and local destinations
//! - `S3ObjectStore`: For production (feature-gated)

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Boxed future returned by every store operation
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ObjectStoreError>> + Send + 'a>>;

/// Metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key (path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Last write timestamp (Unix ms)
    pub modified_at_ms: u64,
}

/// Error type for object store operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    /// Object not found
    NotFound(String),
    /// Retryable failure (network error, timeout, 5xx)
    Transient(String),
    /// Retryable throttling signal (429 / SlowDown)
    Throttled(String),
    /// Non-retryable failure (auth, invalid destination)
    Permanent(String),
}

impl ObjectStoreError {
    /// Whether the writer should retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::Transient(_) | ObjectStoreError::Throttled(_)
        )
    }
}

impl std::fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectStoreError::NotFound(key) => write!(f, "Object not found: {}", key),
            ObjectStoreError::Transient(msg) => write!(f, "Transient store error: {}", msg),
            ObjectStoreError::Throttled(msg) => write!(f, "Store throttled: {}", msg),
            ObjectStoreError::Permanent(msg) => write!(f, "Permanent store error: {}", msg),
        }
    }
}

impl std::error::Error for ObjectStoreError {}

impl From<IoError> for ObjectStoreError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => ObjectStoreError::NotFound(e.to_string()),
            ErrorKind::PermissionDenied
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::Unsupported => ObjectStoreError::Permanent(e.to_string()),
            _ => ObjectStoreError::Transient(e.to_string()),
        }
    }
}

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    /// Put an object (create or overwrite)
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Get an object's contents
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>>;

    /// Check if an object exists
    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Delete an object (missing objects are not an error)
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// List objects with a prefix, sorted by key
    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>>;

    /// Get object metadata without downloading content
    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta>;
}

impl<S: ObjectStore + ?Sized> ObjectStore for Arc<S> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        (**self).put(key, data)
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        (**self).get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        (**self).exists(key)
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        (**self).delete(key)
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        (**self).list(prefix)
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        (**self).head(key)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

/// In-memory object store for unit tests and deterministic simulation.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified_at_ms: u64,
    /// Number of successful puts to this key
    writes: u64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// How many times a key has been written (0 if absent)
    pub fn write_count(&self, key: &str) -> u64 {
        self.data.read().get(key).map(|o| o.writes).unwrap_or(0)
    }

    /// Synchronous read for test assertions
    pub fn get_sync(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().get(key).map(|o| o.data.clone())
    }

    pub fn clear(&self) {
        self.data.write().clear();
    }

    fn meta(key: &str, obj: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size_bytes: obj.data.len() as u64,
            modified_at_ms: obj.modified_at_ms,
        }
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut map = self.data.write();
            let writes = map.get(key).map(|o| o.writes).unwrap_or(0) + 1;
            map.insert(
                key.to_string(),
                StoredObject {
                    data: data.to_vec(),
                    modified_at_ms: now_ms(),
                    writes,
                },
            );
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.get_sync(key)
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.data.read().contains_key(key)) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let map = self.data.read();
            let mut objects: Vec<ObjectMeta> = map
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| Self::meta(k, v))
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| Self::meta(key, obj))
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
        })
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

/// Local filesystem object store.
///
/// Puts go to a `.partial` sibling first and are renamed into place, so a
/// reader never observes a half-written object.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

const PARTIAL_SUFFIX: &str = ".partial";

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

// Directories cannot be opened for syncing here
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

impl LocalFsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsObjectStore {
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn metadata_to_meta(key: String, metadata: &std::fs::Metadata) -> ObjectMeta {
        ObjectMeta {
            key,
            size_bytes: metadata.len(),
            modified_at_ms: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    fn walk_dir(dir: &Path, base: &Path, prefix: &str, out: &mut Vec<ObjectMeta>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::walk_dir(&path, base, prefix, out)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let key = relative.to_string_lossy().replace('\\', "/");
            if key.ends_with(PARTIAL_SUFFIX) || !key.starts_with(prefix) {
                continue;
            }
            let metadata = std::fs::metadata(&path)?;
            out.push(Self::metadata_to_meta(key, &metadata));
        }
        Ok(())
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            let parent = path.parent().map(Path::to_path_buf);
            let mut created_dirs = false;
            if let Some(parent) = &parent {
                if !tokio::fs::try_exists(parent).await? {
                    tokio::fs::create_dir_all(parent).await?;
                    created_dirs = true;
                }
            }

            let mut partial = path.clone().into_os_string();
            partial.push(PARTIAL_SUFFIX);
            let mut file = tokio::fs::File::create(&partial).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&partial, &path).await?;

            // The rename and any new directories are durable only once
            // their parent directories are synced
            if let Some(parent) = &parent {
                sync_dir(parent).await?;
                if created_dirs && parent != &self.base_path {
                    for dir in parent.ancestors().skip(1) {
                        sync_dir(dir).await?;
                        if dir == self.base_path.as_path() {
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move { Ok(tokio::fs::read(self.full_path(key)).await?) })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(tokio::fs::try_exists(self.full_path(key)).await?) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.full_path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let prefix = prefix.to_string();
            let objects = tokio::task::spawn_blocking(move || {
                let mut objects = Vec::new();
                if base.exists() {
                    Self::walk_dir(&base, &base, &prefix, &mut objects)?;
                }
                objects.sort_by(|a, b| a.key.cmp(&b.key));
                Ok::<_, std::io::Error>(objects)
            })
            .await
            .map_err(|e| ObjectStoreError::Transient(format!("list task failed: {}", e)))??;
            Ok(objects)
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(self.full_path(key)).await?;
            Ok(Self::metadata_to_meta(key.to_string(), &metadata))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_put_get() {
        let store = InMemoryObjectStore::new();

        store.put("test/key1", b"hello world").await.unwrap();
        let data = store.get("test/key1").await.unwrap();

        assert_eq!(data, b"hello world");
        assert_eq!(store.write_count("test/key1"), 1);
    }

    #[tokio::test]
    async fn test_inmemory_overwrite_same_key() {
        let store = InMemoryObjectStore::new();

        store.put("k", b"v").await.unwrap();
        store.put("k", b"v").await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.write_count("k"), 2);
    }

    #[tokio::test]
    async fn test_inmemory_missing() {
        let store = InMemoryObjectStore::new();
        assert!(!store.exists("nope").await.unwrap());
        assert_eq!(
            store.get("nope").await,
            Err(ObjectStoreError::NotFound("nope".to_string()))
        );
        // Deleting a missing object is fine
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_inmemory_list_and_head() {
        let store = InMemoryObjectStore::new();

        store.put("users/0002.jsonl", b"b").await.unwrap();
        store.put("users/0001.jsonl", b"aa").await.unwrap();
        store.put("orders/0001.jsonl", b"c").await.unwrap();

        let listed = store.list("users/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["users/0001.jsonl", "users/0002.jsonl"]);

        let meta = store.head("users/0001.jsonl").await.unwrap();
        assert_eq!(meta.size_bytes, 2);
    }

    #[test]
    fn test_io_error_classification() {
        let timeout = IoError::new(ErrorKind::TimedOut, "slow");
        assert!(ObjectStoreError::from(timeout).is_retryable());

        let denied = IoError::new(ErrorKind::PermissionDenied, "no");
        assert!(matches!(
            ObjectStoreError::from(denied),
            ObjectStoreError::Permanent(_)
        ));

        let missing = IoError::new(ErrorKind::NotFound, "gone");
        assert!(matches!(
            ObjectStoreError::from(missing),
            ObjectStoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_localfs_put_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());

        store.put("users/0001.jsonl", b"hello").await.unwrap();
        store.put("users/0002.jsonl", b"world").await.unwrap();
        store.put("orders/0001.jsonl", b"x").await.unwrap();

        assert_eq!(store.get("users/0001.jsonl").await.unwrap(), b"hello");
        assert!(store.exists("users/0002.jsonl").await.unwrap());

        let listed = store.list("users/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|m| !m.key.ends_with(PARTIAL_SUFFIX)));

        store.delete("users/0001.jsonl").await.unwrap();
        assert!(!store.exists("users/0001.jsonl").await.unwrap());
    }

    #[tokio::test]
    async fn test_localfs_put_syncs_into_new_directories() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        let store = LocalFsObjectStore::new(&base);

        store.put("test/public/users/0001.jsonl", b"durable").await.unwrap();
        store.put("top.jsonl", b"root").await.unwrap();

        let object = base.join("test/public/users/0001.jsonl");
        assert_eq!(std::fs::read(&object).unwrap(), b"durable");
        assert_eq!(std::fs::read(base.join("top.jsonl")).unwrap(), b"root");
        let leftovers: Vec<_> = std::fs::read_dir(object.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sync_dir() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).await.unwrap();
        assert!(sync_dir(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_localfs_overwrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());

        store.put("s/0001.bin", b"same").await.unwrap();
        store.put("s/0001.bin", b"same").await.unwrap();

        assert_eq!(store.list("").await.unwrap().len(), 1);
        assert_eq!(store.head("s/0001.bin").await.unwrap().size_bytes, 4);
    }
}
