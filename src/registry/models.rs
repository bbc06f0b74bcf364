//! Data models for the registry.
//!
//! Candidates are single fetchable assets; manifests describe groups of
//! assets and are expanded into candidates.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateStatus {
    Discovered,
    Pending,
    Reserved,
    Fetching,
    Downloaded,      // terminal (may be demoted to DuplicateNear)
    Failed,          // transient, either retried or made permanent
    FailedPermanent, // terminal
    RejectedQuality, // terminal
    DuplicateExact,  // terminal
    DuplicateNear,   // terminal
}

impl CandidateStatus {
    pub const ALL: [CandidateStatus; 10] = [
        CandidateStatus::Discovered,
        CandidateStatus::Pending,
        CandidateStatus::Reserved,
        CandidateStatus::Fetching,
        CandidateStatus::Downloaded,
        CandidateStatus::Failed,
        CandidateStatus::FailedPermanent,
        CandidateStatus::RejectedQuality,
        CandidateStatus::DuplicateExact,
        CandidateStatus::DuplicateNear,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            CandidateStatus::Discovered => "DISCOVERED",
            CandidateStatus::Pending => "PENDING",
            CandidateStatus::Reserved => "RESERVED",
            CandidateStatus::Fetching => "FETCHING",
            CandidateStatus::Downloaded => "DOWNLOADED",
            CandidateStatus::Failed => "FAILED",
            CandidateStatus::FailedPermanent => "FAILED_PERMANENT",
            CandidateStatus::RejectedQuality => "REJECTED_QUALITY",
            CandidateStatus::DuplicateExact => "DUPLICATE_EXACT",
            CandidateStatus::DuplicateNear => "DUPLICATE_NEAR",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_db_str() == s)
    }

    /// States in which a worker currently holds the candidate.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CandidateStatus::Reserved | CandidateStatus::Fetching)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CandidateStatus::Downloaded
                | CandidateStatus::FailedPermanent
                | CandidateStatus::RejectedQuality
                | CandidateStatus::DuplicateExact
                | CandidateStatus::DuplicateNear
        )
    }

    /// Whether records in this state must carry content and perceptual hashes.
    pub fn requires_fingerprint(&self) -> bool {
        matches!(
            self,
            CandidateStatus::Downloaded
                | CandidateStatus::DuplicateExact
                | CandidateStatus::DuplicateNear
        )
    }

    pub fn can_transition_to(&self, next: CandidateStatus) -> bool {
        use CandidateStatus::*;
        matches!(
            (self, next),
            (Discovered, Pending)
                | (Pending, Reserved)
                | (Reserved, Fetching)
                | (Reserved, Pending)
                | (Reserved, RejectedQuality)
                | (Fetching, Downloaded)
                | (Fetching, Failed)
                | (Fetching, FailedPermanent)
                | (Fetching, RejectedQuality)
                | (Fetching, DuplicateExact)
                | (Fetching, DuplicateNear)
                | (Fetching, Pending)
                | (Failed, Pending)
                | (Failed, FailedPermanent)
                | (Downloaded, DuplicateNear)
        )
    }
}

/// Lifecycle state of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManifestStatus {
    Discovered,
    Pending,
    Processing,
    Expanded,
    Failed,
    FailedPermanent,
}

impl ManifestStatus {
    pub const ALL: [ManifestStatus; 6] = [
        ManifestStatus::Discovered,
        ManifestStatus::Pending,
        ManifestStatus::Processing,
        ManifestStatus::Expanded,
        ManifestStatus::Failed,
        ManifestStatus::FailedPermanent,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            ManifestStatus::Discovered => "DISCOVERED",
            ManifestStatus::Pending => "PENDING",
            ManifestStatus::Processing => "PROCESSING",
            ManifestStatus::Expanded => "EXPANDED",
            ManifestStatus::Failed => "FAILED",
            ManifestStatus::FailedPermanent => "FAILED_PERMANENT",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_db_str() == s)
    }

    pub fn can_transition_to(&self, next: ManifestStatus) -> bool {
        use ManifestStatus::*;
        matches!(
            (self, next),
            (Discovered, Pending)
                | (Pending, Processing)
                | (Processing, Expanded)
                | (Processing, Failed)
                | (Processing, FailedPermanent)
                | (Processing, Pending)
                | (Failed, Pending)
                | (Failed, FailedPermanent)
        )
    }
}

/// A single fetchable asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub source: String,
    pub external_ref: String,
    pub title: Option<String>,
    pub size_hint: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub status: CandidateStatus,
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<u64>,
    pub committed_bytes: Option<u64>,
    pub local_path: Option<String>,
    pub duplicate_of: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    /// Unix millis before which the candidate must not be claimed.
    pub next_attempt_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A document describing several sub-resources of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub source: String,
    pub external_ref: String,
    pub status: ManifestStatus,
    pub retry_count: u32,
    pub candidates_created: Option<u64>,
    pub error: Option<String>,
    pub next_attempt_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// What a source knows about a candidate before it is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateSeed {
    pub source: String,
    pub external_ref: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub size_hint: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl CandidateSeed {
    pub fn new(source: impl Into<String>, external_ref: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            external_ref: external_ref.into(),
            ..Default::default()
        }
    }

    pub fn with_size_hint(mut self, bytes: u64) -> Self {
        self.size_hint = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSeed {
    pub source: String,
    pub external_ref: String,
}

impl ManifestSeed {
    pub fn new(source: impl Into<String>, external_ref: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            external_ref: external_ref.into(),
        }
    }
}

/// Field changes applied together with a candidate status transition.
///
/// Fields left as `None` keep their stored value where that is meaningful
/// for the target status; see `SqliteRegistryStore::mark`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateUpdate {
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<u64>,
    pub committed_bytes: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub local_path: Option<String>,
    pub duplicate_of: Option<String>,
    pub error: Option<String>,
    pub next_attempt_at: Option<i64>,
}

impl CandidateUpdate {
    pub fn fingerprint(content_hash: impl Into<String>, perceptual_hash: u64) -> Self {
        Self {
            content_hash: Some(content_hash.into()),
            perceptual_hash: Some(perceptual_hash),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn retry_at(next_attempt_at: i64) -> Self {
        Self {
            next_attempt_at: Some(next_attempt_at),
            ..Default::default()
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestUpdate {
    pub candidates_created: Option<u64>,
    pub error: Option<String>,
    pub next_attempt_at: Option<i64>,
}

/// Everything the dedup index needs to know about a retained asset.
#[derive(Debug, Clone, PartialEq)]
pub struct RetainedFingerprint {
    pub id: String,
    pub content_hash: String,
    pub perceptual_hash: u64,
    pub width: u32,
    pub height: u32,
    pub committed_bytes: u64,
    pub local_path: Option<String>,
}

/// Aggregate count of records per source and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub source: String,
    pub status: String,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_status_db_roundtrip() {
        for status in CandidateStatus::ALL {
            assert_eq!(CandidateStatus::from_db_str(status.as_db_str()), Some(status));
        }
        assert_eq!(CandidateStatus::from_db_str("BOGUS"), None);
    }

    #[test]
    fn terminal_states_only_allow_demotion() {
        for status in CandidateStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for next in CandidateStatus::ALL {
                let allowed = status.can_transition_to(next);
                let is_demotion =
                    status == CandidateStatus::Downloaded && next == CandidateStatus::DuplicateNear;
                assert_eq!(allowed, is_demotion, "{:?} -> {:?}", status, next);
            }
        }
    }

    #[test]
    fn failed_returns_to_pending_or_gives_up() {
        assert!(CandidateStatus::Failed.can_transition_to(CandidateStatus::Pending));
        assert!(CandidateStatus::Failed.can_transition_to(CandidateStatus::FailedPermanent));
        assert!(!CandidateStatus::Failed.can_transition_to(CandidateStatus::Downloaded));
        assert!(!CandidateStatus::Pending.can_transition_to(CandidateStatus::Fetching));
    }

    #[test]
    fn declared_too_small_is_rejected_before_fetch() {
        assert!(CandidateStatus::Reserved.can_transition_to(CandidateStatus::RejectedQuality));
        assert!(!CandidateStatus::Pending.can_transition_to(CandidateStatus::RejectedQuality));
    }

    #[test]
    fn manifest_expanded_is_final() {
        for next in ManifestStatus::ALL {
            assert!(!ManifestStatus::Expanded.can_transition_to(next));
        }
    }
}
