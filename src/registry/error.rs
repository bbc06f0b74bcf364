use thiserror::Error;

/// Errors surfaced by the registry.
///
/// `InvalidTransition` and `MissingFingerprint` mean a caller broke the
/// lifecycle rules; they are never retried.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("illegal transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("no record with id {0}")]
    NotFound(String),

    #[error("status {status} requires content and perceptual hashes (record {id})")]
    MissingFingerprint { id: String, status: &'static str },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl RegistryError {
    /// Integrity errors mean the pipeline's bookkeeping can no longer be trusted.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            RegistryError::InvalidTransition { .. }
                | RegistryError::MissingFingerprint { .. }
        )
    }
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
