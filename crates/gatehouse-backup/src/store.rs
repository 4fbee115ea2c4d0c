//! The object-store seam.
//!
//! The backup orchestrator only needs `put`/`get`/`list`/`delete` by key.
//! Remote endpoint, region, and path-style settings are pass-through
//! configuration for S3-compatible deployments; the in-tree implementation
//! keeps objects on the local filesystem with a metadata side file.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

/// Suffix of metadata side files.
const META_SUFFIX: &str = ".meta.json";

/// Object-store errors.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// No object under the key.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Key contains path traversal or absolute components.
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    /// Transport or filesystem failure.
    #[error("object store i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata failed to serialize.
    #[error("object metadata error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One listed object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
}

/// Remote byte-blob store addressed by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object with metadata.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), ObjectStoreError>;

    /// Fetch an object's bytes.
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// List objects under a key prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

/// Filesystem-backed object store.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a key to a path under the root, rejecting traversal.
    fn key_path(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel.components().any(|c| {
                !matches!(c, Component::Normal(_))
            })
        {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), ObjectStoreError> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        let meta_path = path.with_file_name(format!(
            "{}{META_SUFFIX}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or(key)
        ));
        fs::write(meta_path, serde_json::to_vec_pretty(&metadata)?)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.key_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel.to_string_lossy().replace('\\', "/");
            if key.ends_with(META_SUFFIX) || !key.starts_with(prefix) {
                continue;
            }
            let meta = entry.metadata().map_err(std::io::Error::from)?;
            let last_modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(ObjectMeta {
                key,
                size: meta.len(),
                last_modified,
            });
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(key.to_string()));
            },
            Err(e) => return Err(e.into()),
        }
        let meta_path = path.with_file_name(format!(
            "{}{META_SUFFIX}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or(key)
        ));
        let _ = fs::remove_file(meta_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path());
        store
            .put(
                "backups/demo/demo-1.tar.gz",
                b"payload".to_vec(),
                HashMap::from([("tenantId".to_string(), "demo".to_string())]),
            )
            .await
            .unwrap();
        let bytes = store.get("backups/demo/demo-1.tar.gz").await.unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path());
        assert!(matches!(
            store.get("nope").await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_hides_meta() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path());
        store
            .put("backups/a/one.tar.gz", vec![1], HashMap::new())
            .await
            .unwrap();
        store
            .put("backups/b/two.tar.gz", vec![1, 2], HashMap::new())
            .await
            .unwrap();

        let listed = store.list("backups/a/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "backups/a/one.tar.gz");
        assert_eq!(listed[0].size, 1);
    }

    #[tokio::test]
    async fn traversal_keys_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path());
        for key in ["../escape", "/abs/path", "a/../../b", ""] {
            assert!(
                matches!(
                    store.get(key).await,
                    Err(ObjectStoreError::InvalidKey(_))
                ),
                "{key}"
            );
        }
    }

    #[tokio::test]
    async fn delete_removes_object_and_meta() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path());
        store
            .put("backups/x.tar.gz", vec![0], HashMap::new())
            .await
            .unwrap();
        store.delete("backups/x.tar.gz").await.unwrap();
        assert!(store.list("backups/").await.unwrap().is_empty());
        assert!(matches!(
            store.delete("backups/x.tar.gz").await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }
}
