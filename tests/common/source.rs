//! In-process source with scripted responses

use async_trait::async_trait;
use corpus_harvester::registry::{Candidate, CandidateSeed, Manifest, ManifestSeed};
use corpus_harvester::sources::{FetchError, FetchedAsset, Seed, Source, SourceError};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

type Response = Result<Vec<u8>, FetchError>;

/// A source whose seeds, manifests and fetch results are fixed up front.
///
/// Each URL has a queue of responses; the last one repeats forever. URLs
/// without a script answer with a permanent "404".
pub struct ScriptedSource {
    name: String,
    seeds: Vec<Seed>,
    manifests: HashMap<String, Vec<String>>,
    manifest_failures: Mutex<HashMap<String, VecDeque<FetchError>>>,
    responses: Mutex<HashMap<String, VecDeque<Response>>>,
    fetch_log: Mutex<Vec<String>>,
    min_interval: Duration,
    latency: Duration,
}

impl ScriptedSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            seeds: Vec::new(),
            manifests: HashMap::new(),
            manifest_failures: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            fetch_log: Mutex::new(Vec::new()),
            min_interval: Duration::ZERO,
            latency: Duration::ZERO,
        }
    }

    /// Pace requests like a polite real source.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Every fetch takes this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Like [`ScriptedSource::with_image`], with pixel dimensions declared
    /// up front by the seed.
    pub fn with_declared_image(mut self, url: &str, bytes: Vec<u8>, width: u32, height: u32) -> Self {
        let mut seed = CandidateSeed::new(&self.name, url);
        seed.size_hint = Some(bytes.len() as u64);
        seed.width = Some(width);
        seed.height = Some(height);
        self.seeds.push(Seed::Candidate(seed));
        self.script(url, vec![Ok(bytes)])
    }

    /// Announce `url` during discovery and serve `bytes` for it. The declared
    /// size hint is the real size.
    pub fn with_image(self, url: &str, bytes: Vec<u8>) -> Self {
        let hint = bytes.len() as u64;
        self.with_image_hint(url, bytes, Some(hint))
    }

    pub fn with_image_hint(mut self, url: &str, bytes: Vec<u8>, hint: Option<u64>) -> Self {
        let mut seed = CandidateSeed::new(&self.name, url);
        seed.size_hint = hint;
        self.seeds.push(Seed::Candidate(seed));
        self.script(url, vec![Ok(bytes)])
    }

    /// Replace the responses for `url`.
    pub fn script(self, url: &str, responses: Vec<Response>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), responses.into());
        self
    }

    /// Announce a manifest listing `images`; each image is served as given.
    pub fn with_manifest(mut self, url: &str, images: Vec<(String, Vec<u8>)>) -> Self {
        self.seeds
            .push(Seed::Manifest(ManifestSeed::new(&self.name, url)));
        let mut listed = Vec::new();
        for (image_url, bytes) in images {
            listed.push(image_url.clone());
            self = self.script(&image_url, vec![Ok(bytes)]);
        }
        self.manifests.insert(url.to_string(), listed);
        self
    }

    /// Fail the next expansions of manifest `url` with these errors.
    pub fn with_manifest_failures(self, url: &str, failures: Vec<FetchError>) -> Self {
        self.manifest_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), failures.into());
        self
    }

    /// URLs fetched so far, in order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetch_log.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetch_log
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn discover(&self) -> BoxStream<'_, Result<Seed, SourceError>> {
        stream::iter(self.seeds.clone().into_iter().map(Ok)).boxed()
    }

    async fn fetch(
        &self,
        candidate: &Candidate,
        max_bytes: u64,
    ) -> Result<FetchedAsset, FetchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.fetch_log
            .lock()
            .unwrap()
            .push(candidate.external_ref.clone());
        let response = {
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(&candidate.external_ref) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match response {
            Some(Ok(bytes)) if bytes.len() as u64 > max_bytes => {
                Err(FetchError::TooLarge { limit: max_bytes })
            }
            Some(Ok(bytes)) => Ok(FetchedAsset {
                bytes,
                content_type: Some("image/png".to_string()),
            }),
            Some(Err(e)) => Err(e),
            None => Err(FetchError::Permanent("404 Not Found".to_string())),
        }
    }

    fn expand<'a>(
        &'a self,
        manifest: &'a Manifest,
    ) -> BoxStream<'a, Result<CandidateSeed, FetchError>> {
        let failure = self
            .manifest_failures
            .lock()
            .unwrap()
            .get_mut(&manifest.external_ref)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = failure {
            return stream::iter(vec![Err(err)]).boxed();
        }
        match self.manifests.get(&manifest.external_ref) {
            Some(urls) => stream::iter(
                urls.iter()
                    .map(|url| Ok(CandidateSeed::new(&self.name, url.as_str())))
                    .collect::<Vec<_>>(),
            )
            .boxed(),
            None => stream::iter(vec![Err(FetchError::Permanent(
                "404 Not Found".to_string(),
            ))])
            .boxed(),
        }
    }
}
