//! Duplicate classification and the commit step that depends on it.
//!
//! Classification and everything that changes the retained set (storage
//! commit, file placement, registry transition, index update) happen under
//! one lock, so two workers can never both retain the same content.

use super::fingerprint::{Fingerprint, PerceptualHash};
use super::index::{HashIndex, IndexedAsset};
use crate::registry::{CandidateStatus, CandidateUpdate, RegistryError, RegistryStore};
use crate::storage::{
    AssetStore, AssetStoreError, ReservationToken, StagedAsset, StorageAccountant, StorageError,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupSettings {
    /// Maximum Hamming distance between near duplicates.
    pub threshold: u32,
    /// Number of bit-bands used for bucketing perceptual hashes.
    pub bands: u32,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            bands: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Unique,
    ExactDuplicateOf(String),
    NearDuplicateOf { id: String, distance: u32 },
    /// Near duplicate of a retained asset with fewer pixels; the new asset
    /// takes its place.
    Supersedes { id: String, distance: u32 },
}

#[derive(Debug)]
enum Decision {
    Keep,
    Exact(String),
    Near(String, u32),
    Replace(IndexedAsset, u32),
}

/// What happened to a fetched asset once it reached the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Retained { path: PathBuf, bytes: u64 },
    Replaced { previous: String, path: PathBuf, bytes: u64 },
    ExactDuplicate { of: String },
    NearDuplicate { of: String, distance: u32 },
    /// The actual size did not fit in the remaining budget. The candidate was
    /// returned to PENDING and nothing was kept.
    CapReached,
}

#[derive(Debug, Error)]
pub enum DedupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Assets(#[from] AssetStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct DedupEngine {
    settings: DedupSettings,
    index: Mutex<HashIndex>,
    registry: Arc<dyn RegistryStore>,
    accountant: Arc<StorageAccountant>,
    assets: AssetStore,
}

impl DedupEngine {
    pub fn new(
        settings: DedupSettings,
        registry: Arc<dyn RegistryStore>,
        accountant: Arc<StorageAccountant>,
        assets: AssetStore,
    ) -> Self {
        if settings.bands <= settings.threshold {
            warn!(
                "{} perceptual hash bands with threshold {}: some near duplicates may be missed",
                settings.bands, settings.threshold
            );
        }
        Self {
            settings,
            index: Mutex::new(HashIndex::new(settings.bands)),
            registry,
            accountant,
            assets,
        }
    }

    fn index(&self) -> MutexGuard<'_, HashIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load every retained asset from the registry. Returns the index size.
    pub fn rebuild(&self) -> Result<usize, RegistryError> {
        let mut rebuilt = HashIndex::new(self.settings.bands);
        for retained in self.registry.retained_fingerprints()? {
            rebuilt.insert(IndexedAsset::from(retained));
        }
        let size = rebuilt.len();
        *self.index() = rebuilt;
        info!("Dedup index rebuilt with {} retained assets", size);
        Ok(size)
    }

    pub fn retained_count(&self) -> usize {
        self.index().len()
    }

    pub fn classify(
        &self,
        content_hash: &str,
        perceptual_hash: PerceptualHash,
        pixels: u64,
    ) -> Verdict {
        let index = self.index();
        match Self::decide(&index, self.settings, content_hash, perceptual_hash, pixels) {
            Decision::Keep => Verdict::Unique,
            Decision::Exact(id) => Verdict::ExactDuplicateOf(id),
            Decision::Near(id, distance) => Verdict::NearDuplicateOf { id, distance },
            Decision::Replace(previous, distance) => Verdict::Supersedes {
                id: previous.id,
                distance,
            },
        }
    }

    fn decide(
        index: &HashIndex,
        settings: DedupSettings,
        content_hash: &str,
        perceptual_hash: PerceptualHash,
        pixels: u64,
    ) -> Decision {
        if let Some(existing) = index.exact(content_hash) {
            return Decision::Exact(existing.id.clone());
        }
        match index.nearest(perceptual_hash, settings.threshold) {
            None => Decision::Keep,
            Some((existing, distance)) if pixels > existing.pixels() => {
                Decision::Replace(existing.clone(), distance)
            }
            Some((existing, distance)) => Decision::Near(existing.id.clone(), distance),
        }
    }

    /// Decide the fate of a fetched asset and resolve its reservation.
    ///
    /// The candidate must be FETCHING. On every return path, including errors,
    /// the reservation has been committed or released and the staged bytes
    /// have been persisted or discarded.
    pub fn settle(
        &self,
        candidate_id: &str,
        token: ReservationToken,
        staged: StagedAsset,
        fingerprint: &Fingerprint,
    ) -> Result<Settlement, DedupError> {
        let mut index = self.index();
        let decision = Self::decide(
            &index,
            self.settings,
            &fingerprint.content_hash,
            fingerprint.perceptual_hash,
            fingerprint.pixels(),
        );
        debug!("Candidate {} classified as {:?}", candidate_id, decision);

        let duplicate_update = |of: &str| {
            CandidateUpdate {
                duplicate_of: Some(of.to_string()),
                ..CandidateUpdate::fingerprint(
                    fingerprint.content_hash.clone(),
                    fingerprint.perceptual_hash.0,
                )
            }
            .with_dimensions(fingerprint.width, fingerprint.height)
        };

        match decision {
            Decision::Exact(of) => {
                self.accountant.release(token)?;
                drop(staged);
                self.registry.mark(
                    candidate_id,
                    CandidateStatus::DuplicateExact,
                    duplicate_update(&of),
                )?;
                Ok(Settlement::ExactDuplicate { of })
            }
            Decision::Near(id, distance) => {
                self.accountant.release(token)?;
                drop(staged);
                self.registry.mark(
                    candidate_id,
                    CandidateStatus::DuplicateNear,
                    duplicate_update(&id),
                )?;
                Ok(Settlement::NearDuplicate { of: id, distance })
            }
            Decision::Keep => {
                let bytes = staged.len();
                let (path, token) = self.place(staged, fingerprint, token)?;
                if let Err(e) = self.accountant.commit(token, bytes) {
                    return self.abandon(candidate_id, &path, e);
                }
                self.registry.mark(
                    candidate_id,
                    CandidateStatus::Downloaded,
                    self.retained_update(fingerprint, bytes, &path),
                )?;
                index.insert(self.indexed(candidate_id, fingerprint, bytes, &path));
                Ok(Settlement::Retained { path, bytes })
            }
            Decision::Replace(previous, _) => {
                let bytes = staged.len();
                let (path, token) = self.place(staged, fingerprint, token)?;
                if let Err(e) = self
                    .accountant
                    .commit_replacing(token, bytes, previous.committed_bytes)
                {
                    return self.abandon(candidate_id, &path, e);
                }
                self.registry.supersede(
                    &previous.id,
                    candidate_id,
                    self.retained_update(fingerprint, bytes, &path),
                )?;
                index.replace(
                    &previous.id,
                    self.indexed(candidate_id, fingerprint, bytes, &path),
                );
                if let Some(old_path) = &previous.local_path {
                    if let Err(e) = self.assets.remove(old_path) {
                        warn!("Could not delete superseded asset {:?}: {}", old_path, e);
                    }
                }
                info!(
                    "Candidate {} ({}x{}) supersedes {}",
                    candidate_id, fingerprint.width, fingerprint.height, previous.id
                );
                Ok(Settlement::Replaced {
                    previous: previous.id,
                    path,
                    bytes,
                })
            }
        }
    }

    /// Move staged bytes into the corpus. On failure the reservation is
    /// released before the error is returned.
    fn place(
        &self,
        staged: StagedAsset,
        fingerprint: &Fingerprint,
        token: ReservationToken,
    ) -> Result<(PathBuf, ReservationToken), DedupError> {
        match self
            .assets
            .persist(staged, &fingerprint.content_hash, fingerprint.extension)
        {
            Ok(path) => Ok((path, token)),
            Err(e) => {
                self.accountant.release(token)?;
                Err(e.into())
            }
        }
    }

    /// The commit was refused: drop the placed file and hand the candidate
    /// back to the queue.
    fn abandon(
        &self,
        candidate_id: &str,
        path: &Path,
        error: StorageError,
    ) -> Result<Settlement, DedupError> {
        if let Err(e) = self.assets.remove(path) {
            warn!("Could not delete uncommitted asset {:?}: {}", path, e);
        }
        if !error.is_cap_exceeded() {
            return Err(error.into());
        }
        self.registry.mark(
            candidate_id,
            CandidateStatus::Pending,
            CandidateUpdate::error(error.to_string()),
        )?;
        Ok(Settlement::CapReached)
    }

    fn retained_update(&self, fingerprint: &Fingerprint, bytes: u64, path: &Path) -> CandidateUpdate {
        CandidateUpdate {
            committed_bytes: Some(bytes),
            local_path: Some(path.to_string_lossy().into_owned()),
            ..CandidateUpdate::fingerprint(
                fingerprint.content_hash.clone(),
                fingerprint.perceptual_hash.0,
            )
        }
        .with_dimensions(fingerprint.width, fingerprint.height)
    }

    fn indexed(
        &self,
        id: &str,
        fingerprint: &Fingerprint,
        bytes: u64,
        path: &Path,
    ) -> IndexedAsset {
        IndexedAsset {
            id: id.to_string(),
            content_hash: fingerprint.content_hash.clone(),
            perceptual_hash: fingerprint.perceptual_hash,
            width: fingerprint.width,
            height: fingerprint.height,
            committed_bytes: bytes,
            local_path: Some(path.to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Candidate, CandidateSeed, SqliteRegistryStore};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        registry: Arc<SqliteRegistryStore>,
        accountant: Arc<StorageAccountant>,
        assets: AssetStore,
        engine: DedupEngine,
    }

    fn fixture(cap: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let accountant = Arc::new(StorageAccountant::new(cap));
        let assets = AssetStore::new(dir.path().join("corpus"));
        assets.init().unwrap();
        let engine = DedupEngine::new(
            DedupSettings::default(),
            registry.clone(),
            accountant.clone(),
            assets.clone(),
        );
        Fixture {
            _dir: dir,
            registry,
            accountant,
            assets,
            engine,
        }
    }

    fn fingerprint(content_hash: &str, perceptual_hash: u64, side: u32) -> Fingerprint {
        Fingerprint {
            content_hash: content_hash.to_string(),
            perceptual_hash: PerceptualHash(perceptual_hash),
            width: side,
            height: side,
            extension: "png",
        }
    }

    impl Fixture {
        fn fetching(&self, external_ref: &str) -> Candidate {
            self.registry
                .enqueue_candidate(&CandidateSeed::new("museum", external_ref))
                .unwrap();
            let candidate = self.registry.claim_next_pending("museum").unwrap().unwrap();
            self.registry
                .mark(&candidate.id, CandidateStatus::Fetching, CandidateUpdate::default())
                .unwrap();
            candidate
        }

        fn settle(&self, external_ref: &str, fp: &Fingerprint, bytes: usize) -> (String, Settlement) {
            let candidate = self.fetching(external_ref);
            let token = self.accountant.reserve(bytes as u64).unwrap();
            let staged = self.assets.stage(&vec![7u8; bytes]).unwrap();
            let settlement = self.engine.settle(&candidate.id, token, staged, fp).unwrap();
            (candidate.id, settlement)
        }

        fn status(&self, id: &str) -> CandidateStatus {
            self.registry.get_candidate(id).unwrap().unwrap().status
        }
    }

    #[test]
    fn exact_duplicate_references_first_copy() {
        let f = fixture(10_000);
        let (first, settlement) = f.settle("a", &fingerprint("aaaa01", 0xf0f0, 1000), 300);
        let Settlement::Retained { path, bytes } = settlement else {
            panic!("expected retained, got {:?}", settlement);
        };
        assert_eq!(bytes, 300);
        assert!(path.exists());

        let (second, settlement) = f.settle("b", &fingerprint("aaaa01", 0xf0f0, 1000), 300);
        assert_eq!(settlement, Settlement::ExactDuplicate { of: first.clone() });

        let second = f.registry.get_candidate(&second).unwrap().unwrap();
        assert_eq!(second.status, CandidateStatus::DuplicateExact);
        assert_eq!(second.duplicate_of.as_deref(), Some(first.as_str()));
        assert_eq!(second.content_hash.as_deref(), Some("aaaa01"));
        assert_eq!(f.accountant.snapshot().committed_bytes, 300);
        assert_eq!(f.accountant.snapshot().reserved_bytes, 0);
    }

    #[test]
    fn smaller_near_duplicate_is_discarded() {
        let f = fixture(10_000);
        let (first, _) = f.settle("large", &fingerprint("bbbb01", 0b1111_0000, 2000), 500);
        let (second, settlement) =
            f.settle("small", &fingerprint("bbbb02", 0b1111_0011, 1000), 200);
        assert_eq!(
            settlement,
            Settlement::NearDuplicate {
                of: first.clone(),
                distance: 2
            }
        );
        assert_eq!(f.status(&second), CandidateStatus::DuplicateNear);
        assert_eq!(f.status(&first), CandidateStatus::Downloaded);
        assert_eq!(f.accountant.snapshot().committed_bytes, 500);
    }

    #[test]
    fn larger_near_duplicate_replaces_retained_asset() {
        let f = fixture(10_000);
        let (small, settlement) = f.settle("small", &fingerprint("cccc01", 0xabcd, 900), 200);
        let Settlement::Retained { path: small_path, .. } = settlement else {
            panic!("expected retained");
        };
        let (large, settlement) = f.settle("large", &fingerprint("cccc02", 0xabcf, 1800), 700);
        let Settlement::Replaced { previous, path, bytes } = settlement else {
            panic!("expected replacement, got {:?}", settlement);
        };
        assert_eq!(previous, small);
        assert_eq!(bytes, 700);
        assert!(path.exists());
        assert!(!small_path.exists());

        let demoted = f.registry.get_candidate(&small).unwrap().unwrap();
        assert_eq!(demoted.status, CandidateStatus::DuplicateNear);
        assert_eq!(demoted.duplicate_of.as_deref(), Some(large.as_str()));
        assert_eq!(f.status(&large), CandidateStatus::Downloaded);
        assert_eq!(f.accountant.snapshot().committed_bytes, 700);
        assert_eq!(f.registry.committed_bytes().unwrap(), 700);

        // The demoted bytes now resolve to the replacement.
        assert_eq!(
            f.engine.classify("cccc01", PerceptualHash(0xabcd), 1),
            Verdict::ExactDuplicateOf(large)
        );
    }

    #[test]
    fn commit_past_cap_requeues_candidate() {
        let f = fixture(1000);
        let candidate = f.fetching("big");
        let token = f.accountant.reserve(100).unwrap();
        let staged = f.assets.stage(&vec![1u8; 1500]).unwrap();
        let settlement = f
            .engine
            .settle(&candidate.id, token, staged, &fingerprint("dddd01", 1, 1000))
            .unwrap();
        assert_eq!(settlement, Settlement::CapReached);
        assert_eq!(f.status(&candidate.id), CandidateStatus::Pending);
        assert_eq!(f.accountant.snapshot().committed_bytes, 0);
        assert_eq!(f.accountant.snapshot().reserved_bytes, 0);
        assert!(!f.assets.path_for("dddd01", "png").unwrap().exists());
        assert_eq!(f.engine.retained_count(), 0);
    }

    #[test]
    fn rebuild_restores_retained_set() {
        let f = fixture(10_000);
        let (first, _) = f.settle("a", &fingerprint("eeee01", 0x1234, 1000), 100);
        let restarted = DedupEngine::new(
            DedupSettings::default(),
            f.registry.clone(),
            f.accountant.clone(),
            f.assets.clone(),
        );
        assert_eq!(
            restarted.classify("eeee01", PerceptualHash(0), 1),
            Verdict::Unique
        );
        assert_eq!(restarted.rebuild().unwrap(), 1);
        assert_eq!(
            restarted.classify("eeee01", PerceptualHash(0), 1),
            Verdict::ExactDuplicateOf(first.clone())
        );
        assert_eq!(
            restarted.classify("ffff01", PerceptualHash(0x1235), 1),
            Verdict::NearDuplicateOf {
                id: first,
                distance: 1
            }
        );
    }
}
