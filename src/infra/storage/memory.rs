//! In-memory object store for development/testing.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{ObjectStat, ObjectStore, StorageError};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: Option<String>,
    user_metadata: HashMap<String, String>,
}

#[derive(Default)]
struct StoreInner {
    objects: HashMap<(String, String), StoredObject>,
    failing_stats: HashSet<(String, String)>,
    failing_downloads: HashSet<(String, String)>,
    downloads: u64,
}

/// Objects held in a map keyed by bucket and key.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryObjectStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object, replacing any previous one.
    pub fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Vec<u8>>,
        content_type: Option<&str>,
        user_metadata: &[(&str, &str)],
    ) {
        let object = StoredObject {
            body: body.into(),
            content_type: content_type.map(str::to_owned),
            user_metadata: user_metadata
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        };
        self.inner
            .lock()
            .objects
            .insert((bucket.to_owned(), key.to_owned()), object);
    }

    /// Make every stat of this object fail.
    pub fn fail_stat(&self, bucket: &str, key: &str) {
        self.inner
            .lock()
            .failing_stats
            .insert((bucket.to_owned(), key.to_owned()));
    }

    /// Make every download of this object fail.
    pub fn fail_download(&self, bucket: &str, key: &str) {
        self.inner
            .lock()
            .failing_downloads
            .insert((bucket.to_owned(), key.to_owned()));
    }

    /// Successful downloads so far.
    #[must_use]
    pub fn download_count(&self) -> u64 {
        self.inner.lock().downloads
    }

    fn lookup(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        self.inner
            .lock()
            .objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectStat, StorageError> {
        let id = (bucket.to_owned(), key.to_owned());
        if self.inner.lock().failing_stats.contains(&id) {
            return Err(StorageError::Other(format!("stat refused for {bucket}/{key}")));
        }
        let object = self.lookup(bucket, key)?;
        Ok(ObjectStat {
            size: object.body.len() as u64,
            content_type: object.content_type,
            user_metadata: object.user_metadata,
        })
    }

    async fn download_to_file(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<u64, StorageError> {
        let id = (bucket.to_owned(), key.to_owned());
        if self.inner.lock().failing_downloads.contains(&id) {
            return Err(StorageError::Other(format!(
                "download refused for {bucket}/{key}"
            )));
        }
        let object = self.lookup(bucket, key)?;
        tokio::fs::write(dest, &object.body).await?;
        self.inner.lock().downloads += 1;
        Ok(object.body.len() as u64)
    }
}
