//! Filesystem-backed object store.
//!
//! Layout: `<root>/<bucket>/<key>` holds the body and an optional
//! `<root>/<bucket>/<key>.meta.json` sidecar holds
//! `{"contentType": ..., "userMetadata": {...}}`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::{ObjectStat, ObjectStore, StorageError};

const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    content_type: Option<String>,
    #[serde(default)]
    user_metadata: HashMap<String, String>,
}

/// Buckets as directories under a root.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(bucket).join(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::Other(format!(
                "refusing path outside store: {bucket}/{key}"
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn read_sidecar(path: &Path) -> Result<Sidecar, StorageError> {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(SIDECAR_SUFFIX);
        match tokio::fs::read(PathBuf::from(sidecar)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Metadata(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Sidecar::default()),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_found(bucket: &str, key: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        }
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectStat, StorageError> {
        let path = self.object_path(bucket, key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found(bucket, key, e))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            });
        }
        let sidecar = Self::read_sidecar(&path).await?;
        Ok(ObjectStat {
            size: meta.len(),
            content_type: sidecar.content_type,
            user_metadata: sidecar.user_metadata,
        })
    }

    async fn download_to_file(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<u64, StorageError> {
        let path = self.object_path(bucket, key)?;
        tokio::fs::copy(&path, dest)
            .await
            .map_err(|e| not_found(bucket, key, e))
    }
}
