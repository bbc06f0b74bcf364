mod file_config;

pub use file_config::{FileConfig, HarvestConfig, SourceConfig};

use crate::dedup::DedupSettings;
use crate::sources::SourceKind;
use anyhow::{anyhow, bail, Result};
use byte_unit::Byte;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub data_dir: Option<PathBuf>,
    pub cap: Option<String>,
    pub metrics_port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// 0 disables the metrics listener.
    pub metrics_port: u16,
    pub harvest: HarvestSettings,
    pub sources: Vec<SourceSettings>,
}

/// Tunables of the acquisition pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestSettings {
    pub cap_bytes: u64,
    pub min_width: u32,
    pub min_height: u32,
    pub hamming_threshold: u32,
    pub hash_bands: u32,
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
    pub fetch_timeout_secs: u64,
    pub default_estimate_bytes: u64,
    /// Largest single asset accepted from any source.
    pub max_asset_bytes: u64,
    pub idle_poll_ms: u64,
    /// Pause applied to a source that rate limits without saying for how long.
    pub rate_limit_pause_secs: u64,
    /// Age after which in-flight work found at startup is requeued.
    pub stale_after_secs: u64,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            cap_bytes: 500 * GIB,
            min_width: 900,
            min_height: 900,
            hamming_threshold: 5,
            hash_bands: 8,
            max_retries: 3,
            initial_backoff_secs: 30,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
            fetch_timeout_secs: 60,
            default_estimate_bytes: 8 * MIB,
            max_asset_bytes: 256 * MIB,
            idle_poll_ms: 500,
            rate_limit_pause_secs: 60,
            stale_after_secs: 0,
        }
    }
}

impl HarvestSettings {
    pub fn dedup(&self) -> DedupSettings {
        DedupSettings {
            threshold: self.hamming_threshold,
            bands: self.hash_bands,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn rate_limit_pause(&self) -> Duration {
        Duration::from_secs(self.rate_limit_pause_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub name: String,
    pub kind: SourceKind,
    pub seed_file: PathBuf,
    pub min_interval: Duration,
}

/// Default pause between two requests to the same source.
const DEFAULT_MIN_INTERVAL_MS: u64 = 100;

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .or_else(|| cli.data_dir.clone())
            .ok_or_else(|| {
                anyhow!("data_dir must be specified via --data-dir or in config file")
            })?;

        if !data_dir.exists() {
            bail!("Data directory does not exist: {:?}", data_dir);
        }
        if !data_dir.is_dir() {
            bail!("data_dir is not a directory: {:?}", data_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let defaults = HarvestSettings::default();
        let cap_bytes = match file.cap.as_deref().or(cli.cap.as_deref()) {
            Some(cap) => parse_bytes(cap)?,
            None => defaults.cap_bytes,
        };

        let h = file.harvest.unwrap_or_default();
        let default_estimate_bytes = match h.default_estimate.as_deref() {
            Some(estimate) => parse_bytes(estimate)?,
            None => defaults.default_estimate_bytes,
        };
        let max_asset_bytes = match h.max_asset.as_deref() {
            Some(max) => parse_bytes(max)?,
            None => defaults.max_asset_bytes,
        };
        let harvest = HarvestSettings {
            cap_bytes,
            min_width: h.min_width.unwrap_or(defaults.min_width),
            min_height: h.min_height.unwrap_or(defaults.min_height),
            hamming_threshold: h.hamming_threshold.unwrap_or(defaults.hamming_threshold),
            hash_bands: h.hash_bands.unwrap_or(defaults.hash_bands),
            max_retries: h.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff_secs: h
                .initial_backoff_secs
                .unwrap_or(defaults.initial_backoff_secs),
            max_backoff_secs: h.max_backoff_secs.unwrap_or(defaults.max_backoff_secs),
            backoff_multiplier: h.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
            fetch_timeout_secs: h.fetch_timeout_secs.unwrap_or(defaults.fetch_timeout_secs),
            default_estimate_bytes,
            max_asset_bytes,
            idle_poll_ms: h.idle_poll_ms.unwrap_or(defaults.idle_poll_ms),
            rate_limit_pause_secs: h
                .rate_limit_pause_secs
                .unwrap_or(defaults.rate_limit_pause_secs),
            stale_after_secs: h.stale_after_secs.unwrap_or(defaults.stale_after_secs),
        };

        if harvest.hash_bands == 0 || harvest.hash_bands > 64 || 64 % harvest.hash_bands != 0 {
            bail!(
                "hash_bands must divide 64 (1, 2, 4, 8, 16, 32 or 64), got {}",
                harvest.hash_bands
            );
        }
        if harvest.max_asset_bytes == 0 {
            bail!("max_asset must be greater than zero");
        }
        if harvest.backoff_multiplier < 1.0 {
            bail!(
                "backoff_multiplier must be at least 1.0, got {}",
                harvest.backoff_multiplier
            );
        }

        let mut names = HashSet::new();
        let mut sources = Vec::with_capacity(file.sources.len());
        for source in file.sources {
            if source.name.trim().is_empty() {
                bail!("Source names must not be empty");
            }
            if !names.insert(source.name.clone()) {
                bail!("Duplicate source name: {}", source.name);
            }
            let kind = match source.kind.as_deref() {
                None => SourceKind::Direct,
                Some(kind) => SourceKind::from_str(kind).ok_or_else(|| {
                    anyhow!("Unknown kind {:?} for source {}", kind, source.name)
                })?,
            };
            sources.push(SourceSettings {
                name: source.name,
                kind,
                seed_file: PathBuf::from(source.seed_file),
                min_interval: Duration::from_millis(
                    source.min_interval_ms.unwrap_or(DEFAULT_MIN_INTERVAL_MS),
                ),
            });
        }

        Ok(Self {
            data_dir,
            metrics_port,
            harvest,
            sources,
        })
    }

    pub fn registry_db_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.data_dir.join("assets")
    }
}

/// Parses "500 GiB", "1.5TB" or a plain byte count.
pub fn parse_bytes(s: &str) -> Result<u64> {
    Byte::parse_str(s.trim(), true)
        .map(|b| b.as_u64())
        .map_err(|e| anyhow!("Invalid byte size {:?}: {}", s, e))
}
