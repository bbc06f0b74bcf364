//! Durable record of every candidate and manifest the harvester knows about.
//!
//! The registry is the only owner of lifecycle state. Workers request
//! transitions through [`RegistryStore`] and the store rejects anything the
//! lifecycle does not allow.

mod error;
mod models;
mod schema;
mod store;

pub use error::{RegistryError, RegistryResult};
pub use models::{
    Candidate, CandidateSeed, CandidateStatus, CandidateUpdate, Manifest, ManifestSeed,
    ManifestStatus, ManifestUpdate, RetainedFingerprint, StatusCount,
};
pub use store::{RegistryStore, SqliteRegistryStore};

/// Current time in Unix milliseconds, the unit of every registry timestamp.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
