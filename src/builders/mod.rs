//! Builders to construct the pipeline from configuration.

pub mod pipeline_builder;

pub use pipeline_builder::PipelineBuilder;
