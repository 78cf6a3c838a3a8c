//! In-memory status sink for development/testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{StatusError, StatusSink, StatusUpdate, UploadStatus};

#[derive(Default)]
struct SinkInner {
    updates: Mutex<Vec<StatusUpdate>>,
    failing: AtomicBool,
}

/// Collects every update in publish order.
#[derive(Clone, Default)]
pub struct InMemoryStatusSink {
    inner: Arc<SinkInner>,
}

impl InMemoryStatusSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All updates so far.
    #[must_use]
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.inner.updates.lock().clone()
    }

    /// Statuses published for one upload, in order.
    #[must_use]
    pub fn statuses_for(&self, upload_id: &str) -> Vec<UploadStatus> {
        self.inner
            .updates
            .lock()
            .iter()
            .filter(|u| u.upload_id == upload_id)
            .map(|u| u.status)
            .collect()
    }

    /// Make publishes fail (true) or succeed (false).
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl StatusSink for InMemoryStatusSink {
    async fn publish(&self, update: StatusUpdate) -> Result<(), StatusError> {
        if self.inner.failing.load(Ordering::Relaxed) {
            return Err(StatusError::Publish("sink unavailable".into()));
        }
        self.inner.updates.lock().push(update);
        Ok(())
    }
}
