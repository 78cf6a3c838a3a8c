//! Error types for pipeline components and their collaborators.

use thiserror::Error;

/// Errors produced by the pipeline stages, queues and scheduler.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A queue was closed while a producer or consumer was using it.
    #[error("queue closed: {0}")]
    QueueClosed(&'static str),
    /// The scheduler was shut down while a caller waited for capacity.
    #[error("scheduler closed")]
    SchedulerClosed,
    /// A stage was started twice.
    #[error("stage already running: {0}")]
    AlreadyRunning(&'static str),
    /// Configuration failed validation.
    #[error("config invalid: {0}")]
    Config(String),
}

/// Errors surfaced by a message broker session.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker session is gone or was never connected.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// The delivery was already terminally disposed on the broker side.
    #[error("delivery {0} already disposed")]
    AlreadyDisposed(String),
    /// Any other broker failure.
    #[error("broker error: {0}")]
    Other(String),
}

/// Errors surfaced by an object store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The bucket/key pair does not exist.
    #[error("object not found: {bucket}/{key}")]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },
    /// Local filesystem failure while reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Metadata could not be decoded.
    #[error("invalid metadata: {0}")]
    Metadata(String),
    /// Any other backend failure.
    #[error("storage error: {0}")]
    Other(String),
}

/// Errors surfaced by a probe backend.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The media could not be read or understood.
    #[error("unreadable media: {0}")]
    Unreadable(String),
    /// Probe backend failure.
    #[error("probe failed: {0}")]
    Backend(String),
}

/// Errors surfaced by a status sink.
#[derive(Debug, Error)]
pub enum StatusError {
    /// Status could not be encoded.
    #[error("status encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    /// Status transport failed.
    #[error("status publish failed: {0}")]
    Publish(String),
}

/// Errors produced while decoding an object-store notification.
#[derive(Debug, Error)]
pub enum EventError {
    /// Payload is not valid JSON for a notification.
    #[error("malformed notification: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A mandatory field is missing.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// Object key is not valid percent-encoding.
    #[error("invalid object key encoding: {0}")]
    KeyEncoding(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
