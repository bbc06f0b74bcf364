//! HTTP-backed source: seeds come from a local seed file, assets and
//! manifests are fetched over HTTP.

use super::iiif::{full_image_url, image_service_ids};
use super::seed_file::read_seed_file;
use super::{FetchError, FetchedAsset, Seed, Source, SourceError, SourceKind};
use crate::config::SourceSettings;
use crate::registry::{Candidate, CandidateSeed, Manifest};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub const USER_AGENT: &str = concat!("corpus-harvester/", env!("CARGO_PKG_VERSION"));

pub struct HttpSource {
    name: String,
    kind: SourceKind,
    seed_file: PathBuf,
    min_interval: Duration,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(settings: &SourceSettings, fetch_timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            name: settings.name.clone(),
            kind: settings.kind,
            seed_file: settings.seed_file.clone(),
            min_interval: settings.min_interval,
            client,
        })
    }

    async fn get(&self, url: &str) -> Result<Response, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(request_error)?;
        match classify_status(response.status(), retry_after(&response)) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    async fn manifest_candidates(&self, manifest: &Manifest) -> Result<Vec<CandidateSeed>, FetchError> {
        let response = self.get(&manifest.external_ref).await?;
        let document: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Permanent(format!("manifest is not valid JSON: {}", e))
            } else {
                request_error(e)
            }
        })?;
        let services = image_service_ids(&document);
        debug!(
            "Manifest {} lists {} image services",
            manifest.external_ref,
            services.len()
        );
        Ok(services
            .iter()
            .map(|service| CandidateSeed::new(&self.name, full_image_url(service)))
            .collect())
    }
}

#[async_trait]
impl Source for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn discover(&self) -> BoxStream<'_, Result<Seed, SourceError>> {
        stream::once(read_seed_file(&self.name, &self.seed_file))
            .flat_map(|result| match result {
                Ok(seeds) => stream::iter(seeds.into_iter().map(Ok)).boxed(),
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            })
            .filter(move |seed| {
                let keep = match seed {
                    Ok(Seed::Manifest(m)) if self.kind == SourceKind::Direct => {
                        warn!(
                            "Source {} is direct, ignoring manifest seed {}",
                            self.name, m.external_ref
                        );
                        false
                    }
                    _ => true,
                };
                futures::future::ready(keep)
            })
            .boxed()
    }

    async fn fetch(
        &self,
        candidate: &Candidate,
        max_bytes: u64,
    ) -> Result<FetchedAsset, FetchError> {
        let response = self.get(&candidate.external_ref).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        if let Some(ct) = &content_type {
            if !is_image_content_type(ct) {
                return Err(FetchError::Permanent(format!(
                    "unexpected content type {}",
                    ct
                )));
            }
        }
        let declared = response.content_length();
        if let Some(len) = declared {
            if len > max_bytes {
                debug!(
                    "{} declares {} bytes, limit is {}",
                    candidate.external_ref, len, max_bytes
                );
                return Err(FetchError::TooLarge { limit: max_bytes });
            }
        }
        let bytes = read_limited(response.bytes_stream(), declared, max_bytes).await?;
        Ok(FetchedAsset {
            bytes,
            content_type,
        })
    }

    fn expand<'a>(
        &'a self,
        manifest: &'a Manifest,
    ) -> BoxStream<'a, Result<CandidateSeed, FetchError>> {
        if self.kind != SourceKind::Iiif {
            return stream::iter(vec![Err(FetchError::Permanent(format!(
                "source {} does not understand manifests",
                self.name
            )))])
            .boxed();
        }
        stream::once(self.manifest_candidates(manifest))
            .flat_map(|result| match result {
                Ok(seeds) => stream::iter(seeds.into_iter().map(Ok)).boxed(),
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            })
            .boxed()
    }
}

/// Collect a response body, giving up as soon as it grows past `limit`.
async fn read_limited<S, B>(
    body: S,
    declared: Option<u64>,
    limit: u64,
) -> Result<Vec<u8>, FetchError>
where
    S: Stream<Item = Result<B, reqwest::Error>>,
    B: AsRef<[u8]>,
{
    futures::pin_mut!(body);
    let mut buffer = Vec::with_capacity(declared.unwrap_or(0).min(limit) as usize);
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(request_error)?;
        let chunk = chunk.as_ref();
        if buffer.len() as u64 + chunk.len() as u64 > limit {
            return Err(FetchError::TooLarge { limit });
        }
        buffer.extend_from_slice(chunk);
    }
    Ok(buffer)
}

fn is_image_content_type(content_type: &str) -> bool {
    content_type.starts_with("image/") || content_type.starts_with("application/octet-stream")
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map an HTTP status to a fetch outcome. `None` means success.
fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            FetchError::RateLimited { retry_after }
        }
        StatusCode::REQUEST_TIMEOUT => FetchError::Transient(status.to_string()),
        s if s.is_server_error() => FetchError::Transient(s.to_string()),
        s => FetchError::Permanent(s.to_string()),
    })
}

fn request_error(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Permanent(err.to_string())
    } else {
        FetchError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::OK, None), None);
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None),
            Some(FetchError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None),
            Some(FetchError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            Some(FetchError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, None),
            Some(FetchError::Transient(_))
        ));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7))),
            Some(FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
    }

    fn chunks(sizes: &[usize]) -> impl Stream<Item = Result<Vec<u8>, reqwest::Error>> {
        stream::iter(
            sizes
                .iter()
                .map(|n| Ok(vec![7u8; *n]))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn body_within_limit_is_collected() {
        let body = read_limited(chunks(&[4, 4, 2]), Some(10), 10).await.unwrap();
        assert_eq!(body.len(), 10);
    }

    #[tokio::test]
    async fn body_past_limit_is_abandoned() {
        let err = read_limited(chunks(&[4, 4, 4]), None, 10).await.unwrap_err();
        assert_eq!(err, FetchError::TooLarge { limit: 10 });
    }

    #[test]
    fn content_type_filter() {
        assert!(is_image_content_type("image/jpeg"));
        assert!(is_image_content_type("application/octet-stream"));
        assert!(!is_image_content_type("text/html; charset=utf-8"));
    }
}
