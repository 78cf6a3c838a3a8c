//! Status sink publishing JSON on a broker subject.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Publisher, StatusError, StatusSink, StatusUpdate};

/// Serializes each update and publishes it on one subject.
#[derive(Clone)]
pub struct SubjectStatusSink {
    publisher: Arc<dyn Publisher>,
    subject: String,
}

impl SubjectStatusSink {
    /// Sink publishing on `subject`.
    pub fn new(publisher: Arc<dyn Publisher>, subject: impl Into<String>) -> Self {
        Self {
            publisher,
            subject: subject.into(),
        }
    }

    /// Target subject.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl StatusSink for SubjectStatusSink {
    async fn publish(&self, update: StatusUpdate) -> Result<(), StatusError> {
        let payload = serde_json::to_vec(&update)?;
        self.publisher
            .publish(&self.subject, payload)
            .await
            .map_err(|e| StatusError::Publish(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UploadStatus;
    use crate::infra::InMemoryBroker;

    #[tokio::test]
    async fn publishes_json_on_subject() {
        let broker = InMemoryBroker::new();
        let sink = SubjectStatusSink::new(Arc::new(broker.clone()), "media.status.update");
        sink.publish(StatusUpdate::new("u-1", UploadStatus::Completed).with_duration(Some(12.5)))
            .await
            .unwrap();

        let published = broker.published("media.status.update");
        assert_eq!(published.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(json["uploadId"], "u-1");
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["duration"], 12.5);
    }
}
