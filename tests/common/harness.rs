//! Isolated registry, asset tree and settings for one test

use corpus_harvester::config::HarvestSettings;
use corpus_harvester::harvest::{HarvestError, HarvestReport, RunMode, Scheduler};
use corpus_harvester::registry::{Candidate, CandidateStatus, RegistryStore, SqliteRegistryStore};
use corpus_harvester::sources::Source;
use corpus_harvester::storage::AssetStore;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::constants::{BASE_HEIGHT, BASE_WIDTH};

/// Owns a temporary data directory. Dropping it removes everything.
pub struct Harness {
    pub dir: TempDir,
    pub registry: Arc<SqliteRegistryStore>,
    pub settings: HarvestSettings,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let registry = Arc::new(
            SqliteRegistryStore::new(dir.path().join("registry.db")).expect("open registry"),
        );
        let settings = HarvestSettings {
            cap_bytes: 10 * 1024 * 1024,
            min_width: BASE_WIDTH,
            min_height: BASE_HEIGHT,
            initial_backoff_secs: 0,
            max_retries: 5,
            idle_poll_ms: 10,
            default_estimate_bytes: 64 * 1024,
            ..HarvestSettings::default()
        };
        Self {
            dir,
            registry,
            settings,
        }
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.dir.path().join("assets")
    }

    /// Run a drain-mode harvest over `sources`.
    pub async fn try_run(
        &self,
        sources: Vec<Arc<dyn Source>>,
    ) -> Result<HarvestReport, HarvestError> {
        self.run_with(sources, RunMode::Drain, CancellationToken::new())
            .await
    }

    pub async fn run_with(
        &self,
        sources: Vec<Arc<dyn Source>>,
        mode: RunMode,
        shutdown: CancellationToken,
    ) -> Result<HarvestReport, HarvestError> {
        let scheduler = Scheduler::new(
            self.registry.clone(),
            sources,
            AssetStore::new(self.assets_dir()),
            self.settings.clone(),
        );
        scheduler.run(mode, shutdown).await
    }

    pub async fn run(&self, sources: Vec<Arc<dyn Source>>) -> HarvestReport {
        self.try_run(sources).await.expect("harvest run")
    }

    pub fn candidate(&self, source: &str, url: &str) -> Candidate {
        self.registry
            .find_candidate(source, url)
            .expect("registry query")
            .unwrap_or_else(|| panic!("no candidate {} for {}", url, source))
    }

    /// Candidates a worker still holds. Must be zero once a run has returned.
    pub fn in_flight(&self) -> usize {
        self.count(None, CandidateStatus::Reserved) + self.count(None, CandidateStatus::Fetching)
    }

    pub fn count(&self, source: Option<&str>, status: CandidateStatus) -> usize {
        self.registry
            .list_candidates(source, Some(status))
            .expect("registry query")
            .len()
    }
}
