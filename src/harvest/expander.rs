//! Turns claimed manifests into candidates.

use super::rate_limiter::RateLimiter;
use super::report::ExpanderTally;
use super::retry_policy::{RetryDecision, RetryPolicy};
use super::{HaltSignal, HarvestError, RunMode};
use crate::config::HarvestSettings;
use crate::metrics;
use crate::registry::{now_millis, Manifest, ManifestStatus, ManifestUpdate, RegistryStore};
use crate::sources::{FetchError, Source};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct SourceHandle {
    source: Arc<dyn Source>,
    limiter: Arc<RateLimiter>,
}

pub struct ManifestExpander {
    registry: Arc<dyn RegistryStore>,
    sources: HashMap<String, SourceHandle>,
    policy: RetryPolicy,
    settings: HarvestSettings,
    halt: HaltSignal,
}

impl ManifestExpander {
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        settings: HarvestSettings,
        halt: HaltSignal,
    ) -> Self {
        Self {
            registry,
            sources: HashMap::new(),
            policy: RetryPolicy::new(&settings),
            settings,
            halt,
        }
    }

    /// Make `source` available for expansion, paced by its worker's limiter.
    pub fn add_source(&mut self, source: Arc<dyn Source>, limiter: Arc<RateLimiter>) {
        self.sources
            .insert(source.name().to_string(), SourceHandle { source, limiter });
    }

    pub async fn run(&self, mode: RunMode) -> Result<ExpanderTally, HarvestError> {
        info!("Manifest expander starting for {} sources", self.sources.len());
        let mut tally = ExpanderTally::default();

        loop {
            if self.halt.is_halted() {
                break;
            }

            match self.registry.claim_next_manifest()? {
                Some(manifest) => self.expand(manifest, &mut tally).await?,
                None => {
                    if mode == RunMode::Drain && !self.registry.outstanding_manifests()? {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.idle_poll()) => {}
                        _ = self.halt.halted() => break,
                    }
                }
            }
        }

        info!("Manifest expander stopped: {:?}", tally);
        Ok(tally)
    }

    /// Expand one PROCESSING manifest. Candidate enqueues are idempotent, so
    /// expanding the same manifest again only adds what is missing.
    pub async fn expand(
        &self,
        manifest: Manifest,
        tally: &mut ExpanderTally,
    ) -> Result<(), HarvestError> {
        let Some(handle) = self.sources.get(&manifest.source) else {
            warn!(
                "Manifest {} belongs to unknown source {}",
                manifest.id, manifest.source
            );
            self.registry.record_manifest_failure(
                &manifest.id,
                &format!("unknown source {}", manifest.source),
                None,
            )?;
            tally.failed_permanent += 1;
            return Ok(());
        };

        tokio::select! {
            _ = handle.limiter.acquire() => {}
            _ = self.halt.halted() => {
                self.registry.mark_manifest(
                    &manifest.id,
                    ManifestStatus::Pending,
                    ManifestUpdate::default(),
                )?;
                return Ok(());
            }
        }
        debug!("Expanding manifest {}", manifest.external_ref);

        let mut seeds = handle.source.expand(&manifest);
        let mut listed = 0u64;
        let mut created = 0u64;
        let mut failure = None;
        while let Some(item) = seeds.next().await {
            match item {
                Ok(seed) => {
                    listed += 1;
                    if self.registry.enqueue_candidate(&seed)? {
                        created += 1;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(seeds);

        match failure {
            None => {
                self.registry.mark_manifest(
                    &manifest.id,
                    ManifestStatus::Expanded,
                    ManifestUpdate {
                        candidates_created: Some(created),
                        ..Default::default()
                    },
                )?;
                info!(
                    "Manifest {} expanded: {} listed, {} new candidates",
                    manifest.external_ref, listed, created
                );
                tally.expanded += 1;
                tally.candidates_created += created;
                metrics::record_manifest_outcome(&manifest.source, "expanded");
            }
            Some(err) => self.record_failure(&manifest, handle, err, tally).await?,
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        manifest: &Manifest,
        handle: &SourceHandle,
        err: FetchError,
        tally: &mut ExpanderTally,
    ) -> Result<(), HarvestError> {
        if let FetchError::RateLimited { retry_after } = &err {
            handle
                .limiter
                .push_back(retry_after.unwrap_or(self.settings.rate_limit_pause()))
                .await;
        }

        let failures = manifest.retry_count + 1;
        match self.policy.decide(&err, failures, now_millis()) {
            RetryDecision::RetryAt(at) => {
                warn!(
                    "Expansion of {} failed ({}), retry {} of {}",
                    manifest.external_ref, err, failures, self.policy.max_retries
                );
                self.registry
                    .record_manifest_failure(&manifest.id, &err.to_string(), Some(at))?;
                tally.retried += 1;
                metrics::record_manifest_outcome(&manifest.source, "retried");
            }
            RetryDecision::GiveUp => {
                warn!("Giving up on manifest {}: {}", manifest.external_ref, err);
                self.registry
                    .record_manifest_failure(&manifest.id, &err.to_string(), None)?;
                tally.failed_permanent += 1;
                metrics::record_manifest_outcome(&manifest.source, "failed_permanent");
            }
        }
        Ok(())
    }
}
