//! S3 Object Store Implementation
//!
//! S3-compatible destination built on the `object_store` crate. Works with
//! AWS S3 and with S3-compatible services (MinIO, LocalStack) through a
//! custom endpoint.

use crate::pipeline::object_store::{ObjectMeta, ObjectStore, ObjectStoreError, StoreFuture};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore as ObjectStoreTrait;
use std::sync::Arc;

/// S3 connection settings
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
    /// Key root inside the bucket
    pub root: String,
}

impl S3Config {
    /// Load from `OBJSINK_S3_BUCKET`, `AWS_REGION`, `AWS_ENDPOINT` and
    /// `OBJSINK_S3_ROOT`
    pub fn from_env() -> Result<Self, ObjectStoreError> {
        let bucket = std::env::var("OBJSINK_S3_BUCKET")
            .map_err(|_| ObjectStoreError::Permanent("OBJSINK_S3_BUCKET is not set".into()))?;
        Ok(S3Config {
            bucket,
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: std::env::var("AWS_ENDPOINT").ok(),
            root: std::env::var("OBJSINK_S3_ROOT").unwrap_or_default(),
        })
    }
}

/// S3 Object Store for production deployments
#[derive(Clone)]
pub struct S3ObjectStore {
    store: Arc<dyn ObjectStoreTrait>,
    root: String,
}

impl S3ObjectStore {
    /// Credentials come from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
    pub fn new(config: S3Config) -> Result<Self, ObjectStoreError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .map_err(|e| ObjectStoreError::Permanent(format!("Failed to create S3 store: {}", e)))?;

        Ok(S3ObjectStore {
            store: Arc::new(store),
            root: config.root,
        })
    }

    /// Wrap an existing `object_store` backend
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>, root: String) -> Self {
        S3ObjectStore { store, root }
    }

    fn full_path(&self, key: &str) -> ObjectPath {
        ObjectPath::from(join_root(&self.root, key))
    }

    fn strip_root(&self, path: &ObjectPath) -> String {
        strip_root(&self.root, &path.to_string())
    }

    fn map_error(err: object_store::Error) -> ObjectStoreError {
        match &err {
            object_store::Error::NotFound { path, .. } => ObjectStoreError::NotFound(path.clone()),
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
            | object_store::Error::InvalidPath { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented
            | object_store::Error::UnknownConfigurationKey { .. } => {
                ObjectStoreError::Permanent(err.to_string())
            }
            // The client already retried with its own policy; anything left
            // is treated as transient and retried again by the writer.
            _ => ObjectStoreError::Transient(err.to_string()),
        }
    }

    fn meta(&self, meta: object_store::ObjectMeta) -> ObjectMeta {
        ObjectMeta {
            key: self.strip_root(&meta.location),
            size_bytes: meta.size as u64,
            modified_at_ms: meta.last_modified.timestamp_millis().try_into().unwrap_or(0),
        }
    }
}

fn join_root(root: &str, key: &str) -> String {
    if root.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), key)
    }
}

fn strip_root(root: &str, path: &str) -> String {
    if root.is_empty() {
        return path.to_string();
    }
    let with_slash = format!("{}/", root.trim_end_matches('/'));
    path.strip_prefix(&with_slash).unwrap_or(path).to_string()
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("root", &self.root)
            .finish()
    }
}

impl ObjectStore for S3ObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            self.store
                .put(&path, bytes::Bytes::copy_from_slice(data).into())
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let path = self.full_path(key);
            let result = self.store.get(&path).await.map_err(Self::map_error)?;
            let data = result.bytes().await.map_err(Self::map_error)?;
            Ok(data.to_vec())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let path = self.full_path(key);
            match self.store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            // object_store lists by path segment; filter the remainder locally
            let full = join_root(&self.root, prefix);
            let dir = match full.rfind('/') {
                Some(i) => Some(ObjectPath::from(&full[..i])),
                None => None,
            };
            let listed: Vec<_> = self
                .store
                .list(dir.as_ref())
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let mut objects: Vec<ObjectMeta> = listed
                .into_iter()
                .map(|m| self.meta(m))
                .filter(|m| m.key.starts_with(prefix))
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let path = self.full_path(key);
            let meta = self.store.head(&path).await.map_err(Self::map_error)?;
            Ok(self.meta(meta))
        })
    }
}
