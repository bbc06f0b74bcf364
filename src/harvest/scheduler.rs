//! Owns the source workers and the manifest expander for one harvest run.

use super::expander::ManifestExpander;
use super::rate_limiter::RateLimiter;
use super::report::{ExpanderTally, HarvestReport, SourceTally};
use super::worker::SourceWorker;
use super::{HaltSignal, HarvestError, RunMode};
use crate::config::HarvestSettings;
use crate::dedup::DedupEngine;
use crate::metrics;
use crate::registry::RegistryStore;
use crate::sources::{Seed, Source};
use crate::storage::{AssetStore, StorageAccountant};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Scheduler {
    registry: Arc<dyn RegistryStore>,
    sources: Vec<Arc<dyn Source>>,
    assets: AssetStore,
    settings: HarvestSettings,
}

#[derive(Debug, Default)]
struct Discovery {
    candidates: usize,
    manifests: usize,
}

impl Scheduler {
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        sources: Vec<Arc<dyn Source>>,
        assets: AssetStore,
        settings: HarvestSettings,
    ) -> Self {
        Self {
            registry,
            sources,
            assets,
            settings,
        }
    }

    /// Run the pipeline until every source is drained (in drain mode), the
    /// storage cap is reached, or `shutdown` is cancelled.
    pub async fn run(
        &self,
        mode: RunMode,
        shutdown: CancellationToken,
    ) -> Result<HarvestReport, HarvestError> {
        let max_retries = self.settings.max_retries;
        let requeued_candidates = self.registry.requeue_stale(self.settings.stale_after())?
            + self.registry.requeue_failed(max_retries)?;
        let requeued_manifests = self
            .registry
            .requeue_stale_manifests(self.settings.stale_after())?
            + self.registry.requeue_failed_manifests(max_retries)?;
        if requeued_candidates + requeued_manifests > 0 {
            info!(
                "Recovered {} candidates and {} manifests left unfinished by a previous run",
                requeued_candidates, requeued_manifests
            );
        }

        let committed = self.registry.committed_bytes()?;
        let accountant = Arc::new(StorageAccountant::with_committed(
            self.settings.cap_bytes,
            committed,
        ));
        let ledger = accountant.snapshot();
        metrics::update_ledger(&ledger);
        info!(
            "Storage ledger: {} of {} bytes committed",
            ledger.committed_bytes, ledger.cap_bytes
        );

        self.assets.init()?;
        let engine = Arc::new(DedupEngine::new(
            self.settings.dedup(),
            self.registry.clone(),
            accountant.clone(),
            self.assets.clone(),
        ));
        engine.rebuild()?;

        let discovery = self.discover().await?;

        let halt = HaltSignal::new(shutdown.child_token());
        if ledger.available_bytes() == 0 {
            info!("Storage cap already reached, nothing to fetch");
            halt.cap_reached();
        }

        let mut expander = ManifestExpander::new(
            self.registry.clone(),
            self.settings.clone(),
            halt.clone(),
        );
        let mut workers: Vec<(String, JoinHandle<Result<SourceTally, HarvestError>>)> =
            Vec::new();
        for source in &self.sources {
            let limiter = Arc::new(RateLimiter::new(source.min_interval()));
            expander.add_source(source.clone(), limiter.clone());
            let worker = SourceWorker::new(
                source.clone(),
                self.registry.clone(),
                accountant.clone(),
                engine.clone(),
                self.assets.clone(),
                limiter,
                self.settings.clone(),
                halt.clone(),
            );
            let worker_halt = halt.clone();
            let handle = tokio::spawn(async move {
                let result = worker.run(mode).await;
                if let Err(e) = &result {
                    error!("Worker failed: {}", e);
                    worker_halt.halt();
                }
                result
            });
            workers.push((source.name().to_string(), handle));
        }

        let expander_halt = halt.clone();
        let expander_handle = tokio::spawn(async move {
            let result = expander.run(mode).await;
            if let Err(e) = &result {
                error!("Manifest expander failed: {}", e);
                expander_halt.halt();
            }
            result
        });

        let mut failures = Vec::new();
        let mut sources = BTreeMap::new();
        for (name, handle) in workers {
            match handle.await {
                Ok(Ok(tally)) => {
                    sources.insert(name, tally);
                }
                Ok(Err(e)) => failures.push(format!("worker {}: {}", name, e)),
                Err(e) => failures.push(format!("worker {}: {}", name, e)),
            }
        }
        let manifests = match expander_handle.await {
            Ok(Ok(tally)) => tally,
            Ok(Err(e)) => {
                failures.push(format!("manifest expander: {}", e));
                ExpanderTally::default()
            }
            Err(e) => {
                failures.push(format!("manifest expander: {}", e));
                ExpanderTally::default()
            }
        };

        let ledger = accountant.snapshot();
        metrics::update_ledger(&ledger);
        if ledger.reserved_bytes > 0 {
            warn!(
                "{} bytes still reserved after all workers stopped",
                ledger.reserved_bytes
            );
        }

        let report = HarvestReport {
            requeued_candidates,
            requeued_manifests,
            discovered_candidates: discovery.candidates,
            discovered_manifests: discovery.manifests,
            sources,
            manifests,
            ledger,
            cap_reached: halt.is_cap_reached(),
            interrupted: shutdown.is_cancelled(),
            failures,
        };
        info!(
            "Harvest finished: {} downloaded, {} of {} bytes committed",
            report.total_downloaded(),
            ledger.committed_bytes,
            ledger.cap_bytes
        );

        if report.failures.is_empty() {
            Ok(report)
        } else {
            Err(HarvestError::Aborted {
                report: Box::new(report),
            })
        }
    }

    /// Enqueue every seed the sources announce. Seeds already known are
    /// ignored; a source whose discovery fails is skipped.
    async fn discover(&self) -> Result<Discovery, HarvestError> {
        let mut discovery = Discovery::default();
        for source in &self.sources {
            let mut seeds = source.discover();
            let mut new_candidates = 0;
            let mut new_manifests = 0;
            while let Some(seed) = seeds.next().await {
                match seed {
                    Ok(Seed::Candidate(seed)) => {
                        if self.registry.enqueue_candidate(&seed)? {
                            new_candidates += 1;
                        }
                    }
                    Ok(Seed::Manifest(seed)) => {
                        if self.registry.enqueue_manifest(&seed)? {
                            new_manifests += 1;
                        }
                    }
                    Err(e) => {
                        warn!("Discovery for source {} failed: {}", source.name(), e);
                        break;
                    }
                }
            }
            info!(
                "Source {} discovered {} new candidates and {} new manifests",
                source.name(),
                new_candidates,
                new_manifests
            );
            discovery.candidates += new_candidates;
            discovery.manifests += new_manifests;
        }
        Ok(discovery)
    }
}
