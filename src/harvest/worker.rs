//! Per-source fetch loop.
//!
//! Each claimed candidate goes through reserve, fetch, fingerprint and
//! settle. Every path that obtains a reservation resolves it before the loop
//! looks at the halt signal again.

use super::rate_limiter::RateLimiter;
use super::report::SourceTally;
use super::retry_policy::{RetryDecision, RetryPolicy};
use super::{HaltSignal, HarvestError, RunMode};
use crate::config::HarvestSettings;
use crate::dedup::{self, DedupEngine, Fingerprint, Settlement};
use crate::metrics;
use crate::registry::{now_millis, Candidate, CandidateStatus, CandidateUpdate, RegistryStore};
use crate::sources::{FetchError, Source};
use crate::storage::{AssetStore, ReservationToken, StorageAccountant, StorageError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

enum Step {
    Continue,
    Halt,
}

pub struct SourceWorker {
    source: Arc<dyn Source>,
    registry: Arc<dyn RegistryStore>,
    accountant: Arc<StorageAccountant>,
    engine: Arc<DedupEngine>,
    assets: AssetStore,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    settings: HarvestSettings,
    halt: HaltSignal,
}

impl SourceWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn Source>,
        registry: Arc<dyn RegistryStore>,
        accountant: Arc<StorageAccountant>,
        engine: Arc<DedupEngine>,
        assets: AssetStore,
        limiter: Arc<RateLimiter>,
        settings: HarvestSettings,
        halt: HaltSignal,
    ) -> Self {
        Self {
            source,
            registry,
            accountant,
            engine,
            assets,
            limiter,
            policy: RetryPolicy::new(&settings),
            settings,
            halt,
        }
    }

    fn name(&self) -> &str {
        self.source.name()
    }

    /// Main processing loop - call from a spawned task.
    pub async fn run(&self, mode: RunMode) -> Result<SourceTally, HarvestError> {
        info!(
            "Worker for source {} starting (min_interval={:?})",
            self.name(),
            self.limiter.min_interval()
        );
        let mut tally = SourceTally::default();

        loop {
            if self.halt.is_halted() {
                break;
            }

            match self.registry.claim_next_pending(self.name())? {
                Some(candidate) => {
                    if let Step::Halt = self.process(candidate, &mut tally).await? {
                        break;
                    }
                }
                None => {
                    if mode == RunMode::Drain && !self.registry.outstanding_work(self.name())? {
                        info!("Source {} has no outstanding work", self.name());
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.idle_poll()) => {}
                        _ = self.halt.halted() => break,
                    }
                }
            }
        }

        tally.cap_reached = self.halt.is_cap_reached();
        info!("Worker for source {} stopped: {:?}", self.name(), tally);
        Ok(tally)
    }

    async fn process(
        &self,
        candidate: Candidate,
        tally: &mut SourceTally,
    ) -> Result<Step, HarvestError> {
        if let Some(reason) = self.declared_too_small(&candidate) {
            self.registry.mark(
                &candidate.id,
                CandidateStatus::RejectedQuality,
                CandidateUpdate::error(reason),
            )?;
            debug!("Rejected {} without fetching", candidate.external_ref);
            tally.rejected_quality += 1;
            metrics::record_candidate_outcome(self.name(), "rejected_quality");
            return Ok(Step::Continue);
        }

        let estimate = candidate
            .size_hint
            .filter(|hint| *hint > 0)
            .unwrap_or(self.settings.default_estimate_bytes);

        let token = match self.accountant.reserve(estimate) {
            Ok(token) => token,
            Err(StorageError::CapExceeded {
                requested,
                available,
            }) => {
                info!(
                    "Storage cap reached: candidate {} needs {} bytes, {} available",
                    candidate.id, requested, available
                );
                self.registry
                    .mark(&candidate.id, CandidateStatus::Pending, CandidateUpdate::default())?;
                self.halt.cap_reached();
                return Ok(Step::Halt);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) =
            self.registry
                .mark(&candidate.id, CandidateStatus::Fetching, CandidateUpdate::default())
        {
            self.accountant.release(token)?;
            return Err(e.into());
        }

        tokio::select! {
            _ = self.limiter.acquire() => {}
            _ = self.halt.halted() => {
                self.accountant.release(token)?;
                self.registry
                    .mark(&candidate.id, CandidateStatus::Pending, CandidateUpdate::default())?;
                return Ok(Step::Halt);
            }
        }

        // The reservation is already counted, so it adds back to the headroom.
        let headroom = token.bytes() + self.accountant.snapshot().available_bytes();
        let max_bytes = headroom.min(self.settings.max_asset_bytes);

        debug!("Fetching {} from {}", candidate.external_ref, self.name());
        let started = Instant::now();
        let fetched = self.source.fetch(&candidate, max_bytes).await;
        metrics::record_fetch(self.name(), started.elapsed());

        let asset = match fetched {
            Ok(asset) => asset,
            Err(FetchError::TooLarge { limit }) if limit < self.settings.max_asset_bytes => {
                self.accountant.release(token)?;
                info!(
                    "Storage cap reached: {} does not fit in the remaining {} bytes",
                    candidate.external_ref, limit
                );
                self.registry
                    .mark(&candidate.id, CandidateStatus::Pending, CandidateUpdate::default())?;
                self.halt.cap_reached();
                return Ok(Step::Halt);
            }
            Err(e) => {
                self.accountant.release(token)?;
                self.record_failure(&candidate, e, tally).await?;
                return Ok(Step::Continue);
            }
        };

        let bytes = asset.bytes;
        let decoded = tokio::task::spawn_blocking(move || {
            let result = dedup::fingerprint(&bytes);
            (bytes, result)
        })
        .await;
        let (bytes, decoded) = match decoded {
            Ok(pair) => pair,
            Err(e) => {
                self.accountant.release(token)?;
                return Err(e.into());
            }
        };
        let fingerprint = match decoded {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                self.accountant.release(token)?;
                self.record_failure(&candidate, FetchError::Permanent(e.to_string()), tally)
                    .await?;
                return Ok(Step::Continue);
            }
        };

        if fingerprint.width < self.settings.min_width
            || fingerprint.height < self.settings.min_height
        {
            self.accountant.release(token)?;
            self.registry.mark(
                &candidate.id,
                CandidateStatus::RejectedQuality,
                CandidateUpdate::default()
                    .with_dimensions(fingerprint.width, fingerprint.height)
                    .with_error(format!(
                        "{}x{} is below the {}x{} minimum",
                        fingerprint.width,
                        fingerprint.height,
                        self.settings.min_width,
                        self.settings.min_height
                    )),
            )?;
            debug!(
                "Rejected {} ({}x{})",
                candidate.external_ref, fingerprint.width, fingerprint.height
            );
            tally.rejected_quality += 1;
            metrics::record_candidate_outcome(self.name(), "rejected_quality");
            return Ok(Step::Continue);
        }

        let settlement = self.settle(&candidate, token, bytes, fingerprint).await?;
        metrics::update_ledger(&self.accountant.snapshot());
        let outcome = match settlement {
            Settlement::Retained { bytes, .. } => {
                tally.downloaded += 1;
                tally.bytes_committed += bytes;
                "downloaded"
            }
            Settlement::Replaced { bytes, .. } => {
                tally.downloaded += 1;
                tally.upgraded += 1;
                tally.bytes_committed += bytes;
                "upgraded"
            }
            Settlement::ExactDuplicate { of } => {
                debug!("{} is an exact duplicate of {}", candidate.external_ref, of);
                tally.duplicate_exact += 1;
                "duplicate_exact"
            }
            Settlement::NearDuplicate { of, distance } => {
                debug!(
                    "{} is a near duplicate of {} (distance {})",
                    candidate.external_ref, of, distance
                );
                tally.duplicate_near += 1;
                "duplicate_near"
            }
            Settlement::CapReached => {
                info!(
                    "Storage cap reached while committing candidate {}",
                    candidate.id
                );
                self.halt.cap_reached();
                return Ok(Step::Halt);
            }
        };
        metrics::record_candidate_outcome(self.name(), outcome);
        Ok(Step::Continue)
    }

    /// Stage the bytes and let the engine decide, off the async executor.
    async fn settle(
        &self,
        candidate: &Candidate,
        token: ReservationToken,
        bytes: Vec<u8>,
        fingerprint: Fingerprint,
    ) -> Result<Settlement, HarvestError> {
        let staged = match self.assets.stage(&bytes) {
            Ok(staged) => staged,
            Err(e) => {
                self.accountant.release(token)?;
                return Err(e.into());
            }
        };
        drop(bytes);

        let engine = self.engine.clone();
        let id = candidate.id.clone();
        let settled =
            tokio::task::spawn_blocking(move || engine.settle(&id, token, staged, &fingerprint))
                .await?;
        match settled {
            Ok(settlement) => Ok(settlement),
            Err(e) => {
                error!("Failed to settle candidate {}: {}", candidate.id, e);
                Err(e.into())
            }
        }
    }

    /// Seeds may declare their pixel size; those below the minimum are
    /// rejected without spending a request on them.
    fn declared_too_small(&self, candidate: &Candidate) -> Option<String> {
        let narrow = candidate.width.is_some_and(|w| w < self.settings.min_width);
        let short = candidate.height.is_some_and(|h| h < self.settings.min_height);
        if !(narrow || short) {
            return None;
        }
        let dim = |v: Option<u32>| v.map_or_else(|| "?".to_string(), |v| v.to_string());
        Some(format!(
            "declared {}x{} is below the {}x{} minimum",
            dim(candidate.width),
            dim(candidate.height),
            self.settings.min_width,
            self.settings.min_height
        ))
    }

    async fn record_failure(
        &self,
        candidate: &Candidate,
        err: FetchError,
        tally: &mut SourceTally,
    ) -> Result<(), HarvestError> {
        metrics::record_fetch_failure(self.name(), err.kind());
        if let FetchError::RateLimited { retry_after } = &err {
            let pause = retry_after.unwrap_or(self.settings.rate_limit_pause());
            warn!("Source {} is rate limiting us, pausing {:?}", self.name(), pause);
            self.limiter.push_back(pause).await;
        }

        if !err.is_retryable() {
            warn!("Giving up on {}: {}", candidate.external_ref, err);
            self.registry.mark(
                &candidate.id,
                CandidateStatus::FailedPermanent,
                CandidateUpdate::error(err.to_string()),
            )?;
            tally.failed_permanent += 1;
            metrics::record_candidate_outcome(self.name(), "failed_permanent");
            return Ok(());
        }

        let failures = candidate.retry_count + 1;
        match self.policy.decide(&err, failures, now_millis()) {
            RetryDecision::RetryAt(at) => {
                warn!(
                    "Fetch of {} failed ({}), retry {} of {} in {}ms",
                    candidate.external_ref,
                    err,
                    failures,
                    self.policy.max_retries,
                    at - now_millis()
                );
                self.registry
                    .record_failure(&candidate.id, &err.to_string(), Some(at))?;
                tally.retried += 1;
            }
            RetryDecision::GiveUp => {
                warn!(
                    "Giving up on {} after {} failures: {}",
                    candidate.external_ref, failures, err
                );
                self.registry
                    .record_failure(&candidate.id, &err.to_string(), None)?;
                tally.failed_permanent += 1;
                metrics::record_candidate_outcome(self.name(), "failed_permanent");
            }
        }
        Ok(())
    }
}

