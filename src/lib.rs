//! # Media Admission Pipeline
//!
//! An admission-controlled, three-stage worker for media uploads.
//!
//! Upload notifications are pulled from an at-least-once broker, probed for
//! their processing cost and admitted against a weighted unit budget before
//! any heavy work starts. Tasks that do not fit yet are parked at the tail of
//! the probe queue instead of holding a worker, so cheap work keeps flowing
//! while an expensive transcode waits for room.
//!
//! ```text
//! broker --> Fetcher --> [probe queue] --> Prober --> [execute queue] --> Executor
//! ```
//!
//! ## Key Features
//!
//! - **Cost-Weighted Scheduling**: a fair FIFO semaphore of capacity units
//!   ([`core::ResourceScheduler`]) with bounded waits
//! - **Keep-Alives**: [`core::HeartbeatManager`] extends the broker's
//!   ack-wait while a message is being probed or processed
//! - **Single Disposition**: a [`core::Delivery`] is acked or nacked exactly
//!   once, enforced by ownership
//! - **Backpressure**: bounded queues make a saturated pipeline slow down its
//!   broker pulls
//! - **Pluggable Backends**: broker, object store, probe, processors and
//!   status sink are traits; in-memory and filesystem adapters live in
//!   [`infra`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use media_admission_pipeline::builders::PipelineBuilder;
//! use media_admission_pipeline::config::PipelineConfig;
//! use media_admission_pipeline::infra::{InMemoryBroker, LocalObjectStore};
//!
//! let broker = InMemoryBroker::new();
//! let pipeline = PipelineBuilder::new(PipelineConfig::from_env()?)
//!     .with_message_source(Arc::new(broker.clone()))
//!     .with_object_store(Arc::new(LocalObjectStore::new("/srv/media")))
//!     .with_probe_service(my_probe)
//!     .with_processor(my_transcoder)
//!     .with_status_publisher(Arc::new(broker))
//!     .build()?;
//!
//! pipeline.start().await?;
//! // ...
//! pipeline.shutdown().await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Admission control, keep-alives, task records and collaborator traits.
pub mod core;
/// Configuration models and loading.
pub mod config;
/// Builders to construct the pipeline from configuration.
pub mod builders;
/// Infrastructure adapters for the broker, object store and status sink.
pub mod infra;
/// Pipeline stages, queues and orchestration.
pub mod pipeline;
/// Shared utilities.
pub mod util;
