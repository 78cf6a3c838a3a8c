//! Core admission control, keep-alives, task records and collaborator traits.

pub mod broker;
pub mod cost;
pub mod error;
pub mod heartbeat;
pub mod processor;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod task;

pub use broker::{
    AckHandle, ConsumerOptions, Delivery, InboundMessage, MessageSource, ProgressSignal, Publisher,
};
pub use error::{
    AppResult, BrokerError, EventError, PipelineError, ProbeError, StatusError, StorageError,
};
pub use heartbeat::{HeartbeatHandle, HeartbeatId, HeartbeatManager};
pub use processor::{
    MediaProcessor, ProbeService, ProcessingResult, ProcessorRegistry, RejectionKind,
};
pub use scheduler::{detect_capacity, ResourceHandle, ResourceScheduler};
pub use status::{StatusPublisher, StatusSink, StatusUpdate, UploadStatus};
pub use storage::{ObjectStat, ObjectStore};
pub use task::{ExecuteTask, MediaObject, ProbeResult, ProbeTask, ProcessingJob, UploadPurpose};
