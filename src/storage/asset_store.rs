//! On-disk layout of retained assets.
//!
//! Fetched bytes are first written to a staging file next to the corpus and
//! only moved into place once the deduplication engine decides to keep them.
//! Retained assets live under `<root>/ab/cd/<sha256>.<ext>` so no directory
//! grows unbounded.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Error)]
pub enum AssetStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to move staged asset into place: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("content hash too short for sharding: {0}")]
    InvalidHash(String),
}

/// Bytes waiting for a dedup verdict. Dropping it deletes the file.
#[derive(Debug)]
pub struct StagedAsset {
    file: NamedTempFile,
    len: u64,
}

impl StagedAsset {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
    staging: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        Self { root, staging }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the corpus directories and drop staging files left by a
    /// previous run.
    pub fn init(&self) -> Result<(), AssetStoreError> {
        fs::create_dir_all(&self.root)?;
        if self.staging.exists() {
            for entry in fs::read_dir(&self.staging)? {
                let path = entry?.path();
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Could not remove stale staging file {:?}: {}", path, e);
                }
            }
        }
        fs::create_dir_all(&self.staging)?;
        Ok(())
    }

    pub fn stage(&self, bytes: &[u8]) -> Result<StagedAsset, AssetStoreError> {
        let mut file = NamedTempFile::new_in(&self.staging)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(StagedAsset {
            file,
            len: bytes.len() as u64,
        })
    }

    pub fn path_for(&self, content_hash: &str, extension: &str) -> Result<PathBuf, AssetStoreError> {
        if content_hash.len() < 4 || !content_hash.is_char_boundary(4) {
            return Err(AssetStoreError::InvalidHash(content_hash.to_string()));
        }
        Ok(self
            .root
            .join(&content_hash[0..2])
            .join(&content_hash[2..4])
            .join(format!("{}.{}", content_hash, extension)))
    }

    /// Move a staged asset to its final location and return that path.
    pub fn persist(
        &self,
        staged: StagedAsset,
        content_hash: &str,
        extension: &str,
    ) -> Result<PathBuf, AssetStoreError> {
        let path = self.path_for(content_hash, extension)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        staged.file.persist(&path)?;
        Ok(path)
    }

    /// Delete a retained asset. A missing file is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), AssetStoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
