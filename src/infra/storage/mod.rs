//! Object store backends.

pub mod local;
pub mod memory;

pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;
