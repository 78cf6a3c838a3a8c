//! Object store boundary.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::core::StorageError;

/// Metadata-only view of a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStat {
    /// Size in bytes.
    pub size: u64,
    /// MIME type as recorded by the store.
    pub content_type: Option<String>,
    /// User-supplied metadata, keys as the store reports them.
    pub user_metadata: HashMap<String, String>,
}

/// Read access to the object store holding uploaded media.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fast metadata lookup.
    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectStat, StorageError>;
    /// Download the object body to `dest`, creating or truncating it.
    async fn download_to_file(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<u64, StorageError>;
}
