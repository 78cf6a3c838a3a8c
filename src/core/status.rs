//! Status events mirrored to external systems.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{RejectionKind, StatusError};

/// Lifecycle status of an upload as seen by external systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    /// Processing started.
    Processing,
    /// Processing finished successfully.
    Completed,
    /// Processing failed; the broker may redeliver.
    Failed,
    /// A malware scan rejected the file.
    MalwareDetected,
    /// The file is not valid media.
    InvalidFile,
}

impl From<RejectionKind> for UploadStatus {
    fn from(kind: RejectionKind) -> Self {
        match kind {
            RejectionKind::MalwareDetected => Self::MalwareDetected,
            RejectionKind::InvalidFile => Self::InvalidFile,
        }
    }
}

/// One status event. Serializes as
/// `{"uploadId","status","reason","duration"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Correlation id of the upload.
    pub upload_id: String,
    /// New status.
    pub status: UploadStatus,
    /// Error or rejection detail.
    pub reason: Option<String>,
    /// Media duration in seconds.
    pub duration: Option<f64>,
}

impl StatusUpdate {
    /// Status without detail.
    pub fn new(upload_id: impl Into<String>, status: UploadStatus) -> Self {
        Self {
            upload_id: upload_id.into(),
            status,
            reason: None,
            duration: None,
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a duration.
    #[must_use]
    pub const fn with_duration(mut self, duration: Option<f64>) -> Self {
        self.duration = duration;
        self
    }
}

/// Transport for status events.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Deliver one update.
    async fn publish(&self, update: StatusUpdate) -> Result<(), StatusError>;
}

/// Best-effort front for a [`StatusSink`]: failures are logged and dropped,
/// never returned to the caller.
#[derive(Clone)]
pub struct StatusPublisher {
    sink: Arc<dyn StatusSink>,
}

impl StatusPublisher {
    /// Wrap a sink.
    #[must_use]
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink }
    }

    /// Publish an update, logging any failure.
    pub async fn publish(&self, update: StatusUpdate) {
        let upload_id = update.upload_id.clone();
        let status = update.status;
        match self.sink.publish(update).await {
            Ok(()) => debug!(upload_id = %upload_id, ?status, "status published"),
            Err(e) => warn!(upload_id = %upload_id, ?status, error = %e, "status publish failed"),
        }
    }

    /// `PROCESSING`.
    pub async fn publish_processing(&self, upload_id: &str) {
        self.publish(StatusUpdate::new(upload_id, UploadStatus::Processing))
            .await;
    }

    /// `COMPLETED` with an optional duration.
    pub async fn publish_completed(&self, upload_id: &str, duration: Option<f64>) {
        self.publish(
            StatusUpdate::new(upload_id, UploadStatus::Completed).with_duration(duration),
        )
        .await;
    }

    /// `FAILED` with the error detail.
    pub async fn publish_failed(&self, upload_id: &str, reason: &str) {
        self.publish(StatusUpdate::new(upload_id, UploadStatus::Failed).with_reason(reason))
            .await;
    }

    /// `MALWARE_DETECTED` or `INVALID_FILE`.
    pub async fn publish_rejected(&self, upload_id: &str, kind: RejectionKind, reason: &str) {
        self.publish(StatusUpdate::new(upload_id, kind.into()).with_reason(reason))
            .await;
    }
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher").finish_non_exhaustive()
    }
}
