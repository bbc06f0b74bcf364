use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub data_dir: Option<String>,
    pub metrics_port: Option<u16>,
    /// Storage cap, e.g. "500 GiB" or a plain byte count.
    pub cap: Option<String>,

    pub harvest: Option<HarvestConfig>,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct HarvestConfig {
    pub min_width: Option<u32>,
    pub min_height: Option<u32>,
    pub hamming_threshold: Option<u32>,
    pub hash_bands: Option<u32>,
    pub max_retries: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub fetch_timeout_secs: Option<u64>,
    /// Reservation for candidates without a size hint, e.g. "8 MiB".
    pub default_estimate: Option<String>,
    /// Largest single asset accepted, e.g. "256 MiB".
    pub max_asset: Option<String>,
    pub idle_poll_ms: Option<u64>,
    pub rate_limit_pause_secs: Option<u64>,
    pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    /// "direct" or "iiif"
    #[serde(default)]
    pub kind: Option<String>,
    pub seed_file: String,
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
