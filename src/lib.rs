//! Corpus Harvester Library
//!
//! Acquires a bounded, deduplicated image corpus from many remote sources.
//! This library exposes the internal modules for testing and reuse by the
//! `harvester` binary.

pub mod config;
pub mod dedup;
pub mod harvest;
pub mod metrics;
pub mod registry;
pub mod sources;
pub mod sqlite_persistence;
pub mod storage;

// Re-export commonly used types for convenience
pub use harvest::{HarvestError, HarvestReport, RunMode, Scheduler};
pub use registry::{RegistryStore, SqliteRegistryStore};
pub use storage::{AssetStore, StorageAccountant};
