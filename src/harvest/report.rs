use crate::storage::LedgerSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Outcome counts of one source worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceTally {
    pub downloaded: u64,
    /// Downloads that replaced a lower-resolution near duplicate.
    pub upgraded: u64,
    pub duplicate_exact: u64,
    pub duplicate_near: u64,
    pub rejected_quality: u64,
    /// Failed attempts that were scheduled for another try.
    pub retried: u64,
    pub failed_permanent: u64,
    pub bytes_committed: u64,
    pub cap_reached: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpanderTally {
    pub expanded: u64,
    pub candidates_created: u64,
    pub retried: u64,
    pub failed_permanent: u64,
}

/// Result of one harvest run.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub requeued_candidates: usize,
    pub requeued_manifests: usize,
    pub discovered_candidates: usize,
    pub discovered_manifests: usize,
    pub sources: BTreeMap<String, SourceTally>,
    pub manifests: ExpanderTally,
    pub ledger: LedgerSnapshot,
    pub cap_reached: bool,
    /// Stopped by an external shutdown request rather than by running out of
    /// work or budget.
    pub interrupted: bool,
    /// Workers that stopped on an integrity error.
    pub failures: Vec<String>,
}

impl HarvestReport {
    pub fn total_downloaded(&self) -> u64 {
        self.sources.values().map(|t| t.downloaded).sum()
    }
}

impl fmt::Display for HarvestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Storage: {} committed, {} reserved, cap {}",
            self.ledger.committed_bytes, self.ledger.reserved_bytes, self.ledger.cap_bytes
        )?;
        writeln!(
            f,
            "Manifests: {} expanded into {} candidates, {} failed",
            self.manifests.expanded, self.manifests.candidates_created, self.manifests.failed_permanent
        )?;
        for (source, tally) in &self.sources {
            writeln!(
                f,
                "  {:<20} downloaded={} upgraded={} exact={} near={} rejected={} retried={} failed={}",
                source,
                tally.downloaded,
                tally.upgraded,
                tally.duplicate_exact,
                tally.duplicate_near,
                tally.rejected_quality,
                tally.retried,
                tally.failed_permanent
            )?;
        }
        if self.cap_reached {
            writeln!(f, "Storage cap reached")?;
        } else if self.interrupted {
            writeln!(f, "Interrupted")?;
        }
        for failure in &self.failures {
            writeln!(f, "ERROR: {}", failure)?;
        }
        Ok(())
    }
}
