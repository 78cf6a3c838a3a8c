//! Status sinks.

pub mod memory;
pub mod subject;

pub use memory::InMemoryStatusSink;
pub use subject::SubjectStatusSink;
