//! Infrastructure adapters for the broker, object store and status transport.

pub mod broker;
pub mod status;
pub mod storage;

pub use broker::{InMemoryBroker, MessageRecord};
pub use status::{InMemoryStatusSink, SubjectStatusSink};
pub use storage::{InMemoryObjectStore, LocalObjectStore};
