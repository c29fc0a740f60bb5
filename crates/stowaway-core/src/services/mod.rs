//! Shared services used across sync components.

mod storage;

pub use storage::{KeyValueStore, StorageService};
