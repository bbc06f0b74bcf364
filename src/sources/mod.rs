//! Upstream sources of candidates and manifests.
//!
//! Every source implements [`Source`]. Concrete implementations are chosen
//! from configuration by [`build_source`].

mod http;
mod iiif;
mod seed_file;

pub use http::HttpSource;
pub use iiif::{full_image_url, image_service_ids};
pub use seed_file::{parse_seed_lines, read_seed_file};

use crate::config::SourceSettings;
use crate::registry::{Candidate, CandidateSeed, Manifest, ManifestSeed};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Something a source announced during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seed {
    Candidate(CandidateSeed),
    Manifest(ManifestSeed),
}

#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedAsset {
    pub fn actual_size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Outcome classes of a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network error, timeout or server hiccup. Retried with backoff.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The resource is gone or is not what we want. Never retried.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),

    /// The source asked us to slow down.
    #[error("rate limited by source (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The body would exceed the byte limit the fetch was started with.
    #[error("response exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::RateLimited { .. })
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transient(_) => "transient",
            FetchError::Permanent(_) => "permanent",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::TooLarge { .. } => "too_large",
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid seed at line {line}: {reason}")]
    InvalidSeed { line: usize, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Capability interface every upstream source provides.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Minimum delay between two requests to this source.
    fn min_interval(&self) -> Duration;

    /// Enumerate seeds. Finite and safe to run again after a restart.
    fn discover(&self) -> BoxStream<'_, Result<Seed, SourceError>>;

    /// Fetch the candidate's bytes. Bodies larger than `max_bytes` are
    /// refused with [`FetchError::TooLarge`] without being buffered.
    async fn fetch(&self, candidate: &Candidate, max_bytes: u64)
        -> Result<FetchedAsset, FetchError>;

    /// Enumerate the candidates described by a manifest of this source.
    fn expand<'a>(&'a self, manifest: &'a Manifest)
        -> BoxStream<'a, Result<CandidateSeed, FetchError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Seeds are direct image URLs.
    Direct,
    /// Seeds may be IIIF Presentation manifests.
    Iiif,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Direct => "direct",
            SourceKind::Iiif => "iiif",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Some(SourceKind::Direct),
            "iiif" => Some(SourceKind::Iiif),
            _ => None,
        }
    }
}

/// Instantiate the source described by `settings`.
pub fn build_source(
    settings: &SourceSettings,
    fetch_timeout: Duration,
) -> Result<Arc<dyn Source>, SourceError> {
    let source: Arc<dyn Source> = match settings.kind {
        SourceKind::Direct | SourceKind::Iiif => Arc::new(HttpSource::new(settings, fetch_timeout)?),
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_parsing() {
        assert_eq!(SourceKind::from_str("IIIF"), Some(SourceKind::Iiif));
        assert_eq!(SourceKind::from_str("direct"), Some(SourceKind::Direct));
        assert_eq!(SourceKind::from_str("ftp"), None);
        assert_eq!(SourceKind::Iiif.as_str(), "iiif");
    }

    #[test]
    fn only_permanent_failures_are_final() {
        assert!(FetchError::Transient("reset".into()).is_retryable());
        assert!(FetchError::RateLimited { retry_after: None }.is_retryable());
        assert!(!FetchError::Permanent("404".into()).is_retryable());
        assert!(!FetchError::TooLarge { limit: 10 }.is_retryable());
    }
}
