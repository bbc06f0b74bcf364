//! Two-tier deduplication: exact content hashes and perceptual near-duplicates.

mod engine;
mod fingerprint;
mod index;

pub use engine::{DedupEngine, DedupError, DedupSettings, Settlement, Verdict};
pub use fingerprint::{
    content_hash, difference_hash, fingerprint, Fingerprint, FingerprintError, PerceptualHash,
};
pub use index::{HashIndex, IndexedAsset};
