//! The concurrent acquisition pipeline: one worker per source, one manifest
//! expander, and the scheduler that owns them.

mod expander;
mod rate_limiter;
mod report;
mod retry_policy;
mod scheduler;
mod worker;

pub use expander::ManifestExpander;
pub use rate_limiter::RateLimiter;
pub use report::{ExpanderTally, HarvestReport, SourceTally};
pub use retry_policy::{RetryDecision, RetryPolicy};
pub use scheduler::Scheduler;
pub use worker::SourceWorker;

use crate::dedup::DedupError;
use crate::registry::RegistryError;
use crate::storage::{AssetStoreError, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that stop a worker. Everything recoverable is handled in place.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("storage ledger error: {0}")]
    Storage(#[from] StorageError),

    #[error("asset store error: {0}")]
    Assets(#[from] AssetStoreError),

    #[error("dedup error: {0}")]
    Dedup(#[from] DedupError),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("harvest aborted: {}", .report.failures.join("; "))]
    Aborted { report: Box<HarvestReport> },
}

/// Whether workers leave once their source has nothing left to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Exit when no candidate or manifest of the source can still change.
    Drain,
    /// Keep polling for new work until halted.
    Continuous,
}

/// Shared stop signal: cancelled on shutdown, on an integrity failure or
/// when the storage cap is reached.
#[derive(Debug, Clone)]
pub struct HaltSignal {
    token: CancellationToken,
    cap_reached: Arc<AtomicBool>,
}

impl HaltSignal {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            cap_reached: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn halted(&self) {
        self.token.cancelled().await
    }

    pub fn halt(&self) {
        self.token.cancel();
    }

    /// Record that the budget is exhausted and stop everyone.
    pub fn cap_reached(&self) {
        self.cap_reached.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_cap_reached(&self) -> bool {
        self.cap_reached.load(Ordering::SeqCst)
    }
}
