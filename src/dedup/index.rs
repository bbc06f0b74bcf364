//! In-memory index of retained assets.
//!
//! Exact lookups go through a content-hash map. Near-duplicate lookups split
//! each 64-bit perceptual hash into equal bit-bands and bucket assets by band
//! value; only assets sharing at least one bucket are compared. Two hashes
//! within Hamming distance `t` differ in at most `t` bands, so with more than
//! `t` bands they always share one.

use super::fingerprint::PerceptualHash;
use crate::registry::RetainedFingerprint;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedAsset {
    pub id: String,
    pub content_hash: String,
    pub perceptual_hash: PerceptualHash,
    pub width: u32,
    pub height: u32,
    pub committed_bytes: u64,
    pub local_path: Option<PathBuf>,
}

impl IndexedAsset {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl From<RetainedFingerprint> for IndexedAsset {
    fn from(retained: RetainedFingerprint) -> Self {
        Self {
            id: retained.id,
            content_hash: retained.content_hash,
            perceptual_hash: PerceptualHash(retained.perceptual_hash),
            width: retained.width,
            height: retained.height,
            committed_bytes: retained.committed_bytes,
            local_path: retained.local_path.map(PathBuf::from),
        }
    }
}

pub struct HashIndex {
    bands: u32,
    /// content hash -> id of the retained asset representing it
    by_content: HashMap<String, String>,
    assets: HashMap<String, IndexedAsset>,
    buckets: Vec<HashMap<u64, Vec<String>>>,
}

impl HashIndex {
    pub fn new(bands: u32) -> Self {
        let bands = bands.clamp(1, 64);
        Self {
            bands,
            by_content: HashMap::new(),
            assets: HashMap::new(),
            buckets: vec![HashMap::new(); bands as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn exact(&self, content_hash: &str) -> Option<&IndexedAsset> {
        self.by_content
            .get(content_hash)
            .and_then(|id| self.assets.get(id))
    }

    /// Closest retained asset within `threshold`, with its distance.
    pub fn nearest(
        &self,
        hash: PerceptualHash,
        threshold: u32,
    ) -> Option<(&IndexedAsset, u32)> {
        let mut seen = HashSet::new();
        let mut best: Option<(&IndexedAsset, u32)> = None;
        for (band, buckets) in self.buckets.iter().enumerate() {
            let Some(ids) = buckets.get(&hash.band(band as u32, self.bands)) else {
                continue;
            };
            for id in ids {
                if !seen.insert(id.as_str()) {
                    continue;
                }
                let Some(asset) = self.assets.get(id) else {
                    continue;
                };
                let distance = asset.perceptual_hash.hamming(&hash);
                if distance > threshold {
                    continue;
                }
                let closer = match best {
                    None => true,
                    Some((current, d)) => distance < d || (distance == d && asset.id < current.id),
                };
                if closer {
                    best = Some((asset, distance));
                }
            }
        }
        best
    }

    pub fn insert(&mut self, asset: IndexedAsset) {
        if self.assets.contains_key(&asset.id) {
            self.remove(&asset.id.clone());
        }
        for (band, buckets) in self.buckets.iter_mut().enumerate() {
            buckets
                .entry(asset.perceptual_hash.band(band as u32, self.bands))
                .or_default()
                .push(asset.id.clone());
        }
        self.by_content
            .insert(asset.content_hash.clone(), asset.id.clone());
        self.assets.insert(asset.id.clone(), asset);
    }

    pub fn remove(&mut self, id: &str) -> Option<IndexedAsset> {
        let asset = self.assets.remove(id)?;
        for (band, buckets) in self.buckets.iter_mut().enumerate() {
            let key = asset.perceptual_hash.band(band as u32, self.bands);
            if let Some(ids) = buckets.get_mut(&key) {
                ids.retain(|other| other != id);
                if ids.is_empty() {
                    buckets.remove(&key);
                }
            }
        }
        self.by_content.retain(|_, owner| owner != id);
        Some(asset)
    }

    /// Swap a retained asset for the one that supersedes it. Exact copies of
    /// the old bytes resolve to the replacement afterwards.
    pub fn replace(&mut self, old_id: &str, replacement: IndexedAsset) {
        let old = self.remove(old_id);
        let new_id = replacement.id.clone();
        self.insert(replacement);
        if let Some(old) = old {
            self.by_content.insert(old.content_hash, new_id);
        }
    }
}
