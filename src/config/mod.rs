//! Configuration models for the pipeline, its queues and timeouts.

pub mod pipeline;

pub use pipeline::{ConsumerConfig, PipelineConfig};
