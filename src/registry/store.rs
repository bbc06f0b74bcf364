//! Registry storage and persistence.
//!
//! SQLite-backed store for candidates and manifests. Every status change goes
//! through a lifecycle check, so the database never holds a record in a state
//! it could not legally have reached.

use super::error::{RegistryError, RegistryResult};
use super::models::*;
use super::now_millis;
use super::schema::REGISTRY_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use anyhow::Result;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Durable store of candidates and manifests.
pub trait RegistryStore: Send + Sync {
    // === Candidates ===

    /// Idempotently add a candidate keyed by (source, external_ref).
    /// Returns true if a new record was created.
    fn enqueue_candidate(&self, seed: &CandidateSeed) -> RegistryResult<bool>;

    /// Add many candidates in one transaction. Returns how many were new.
    fn enqueue_candidates(&self, seeds: &[CandidateSeed]) -> RegistryResult<usize>;

    fn get_candidate(&self, id: &str) -> RegistryResult<Option<Candidate>>;

    fn find_candidate(&self, source: &str, external_ref: &str)
        -> RegistryResult<Option<Candidate>>;

    fn list_candidates(
        &self,
        source: Option<&str>,
        status: Option<CandidateStatus>,
    ) -> RegistryResult<Vec<Candidate>>;

    /// Atomically move the oldest eligible PENDING candidate of `source` to
    /// RESERVED and return it.
    fn claim_next_pending(&self, source: &str) -> RegistryResult<Option<Candidate>>;

    /// Validated status transition. Moving to FAILED increments the retry counter.
    fn mark(
        &self,
        id: &str,
        status: CandidateStatus,
        update: CandidateUpdate,
    ) -> RegistryResult<()>;

    /// Record a retryable failure in one transaction: FETCHING -> FAILED
    /// (retry counter +1), then PENDING until `retry_at`, or FAILED_PERMANENT
    /// when `retry_at` is `None`.
    fn record_failure(&self, id: &str, error: &str, retry_at: Option<i64>)
        -> RegistryResult<()>;

    /// Promote `new_id` to DOWNLOADED and demote the retained `old_id` to
    /// DUPLICATE_NEAR pointing at it, in a single transaction.
    fn supersede(&self, old_id: &str, new_id: &str, update: CandidateUpdate)
        -> RegistryResult<()>;

    /// Return RESERVED/FETCHING candidates untouched for at least `max_age`
    /// to PENDING. Returns how many were requeued.
    fn requeue_stale(&self, max_age: Duration) -> RegistryResult<usize>;

    /// Resolve FAILED candidates left behind by an interrupted run: those
    /// past `max_retries` become FAILED_PERMANENT, the rest return to PENDING.
    /// Returns how many were resolved.
    fn requeue_failed(&self, max_retries: u32) -> RegistryResult<usize>;

    /// Operator retry: FAILED_PERMANENT candidates and manifests go back to
    /// PENDING with a fresh retry budget.
    fn reset_failed_permanent(&self, source: Option<&str>) -> RegistryResult<usize>;

    /// Sum of committed bytes over all DOWNLOADED candidates.
    fn committed_bytes(&self) -> RegistryResult<u64>;

    fn retained_fingerprints(&self) -> RegistryResult<Vec<RetainedFingerprint>>;

    /// Whether `source` still has candidates or manifests that may produce work.
    fn outstanding_work(&self, source: &str) -> RegistryResult<bool>;

    fn status_counts(&self) -> RegistryResult<Vec<StatusCount>>;

    // === Manifests ===

    fn enqueue_manifest(&self, seed: &ManifestSeed) -> RegistryResult<bool>;

    fn get_manifest(&self, id: &str) -> RegistryResult<Option<Manifest>>;

    /// Atomically move the oldest eligible PENDING manifest to PROCESSING.
    fn claim_next_manifest(&self) -> RegistryResult<Option<Manifest>>;

    fn mark_manifest(
        &self,
        id: &str,
        status: ManifestStatus,
        update: ManifestUpdate,
    ) -> RegistryResult<()>;

    /// Manifest counterpart of [`RegistryStore::record_failure`], starting
    /// from PROCESSING.
    fn record_manifest_failure(
        &self,
        id: &str,
        error: &str,
        retry_at: Option<i64>,
    ) -> RegistryResult<()>;

    fn requeue_stale_manifests(&self, max_age: Duration) -> RegistryResult<usize>;

    fn requeue_failed_manifests(&self, max_retries: u32) -> RegistryResult<usize>;

    fn outstanding_manifests(&self) -> RegistryResult<bool>;

    fn manifest_status_counts(&self) -> RegistryResult<Vec<StatusCount>>;
}

/// SQLite-backed registry.
pub struct SqliteRegistryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistryStore {
    /// Opens an existing registry database or creates a new one.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, REGISTRY_VERSIONED_SCHEMAS, "registry")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory(REGISTRY_VERSIONED_SCHEMAS)?)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn row_to_candidate(row: &Row) -> rusqlite::Result<Candidate> {
        let status: String = row.get("status")?;
        let perceptual_hash: Option<String> = row.get("perceptual_hash")?;
        Ok(Candidate {
            id: row.get("id")?,
            source: row.get("source")?,
            external_ref: row.get("external_ref")?,
            title: row.get("title")?,
            size_hint: row.get::<_, Option<i64>>("size_hint")?.map(|v| v as u64),
            width: row.get::<_, Option<i64>>("width")?.map(|v| v as u32),
            height: row.get::<_, Option<i64>>("height")?.map(|v| v as u32),
            status: CandidateStatus::from_db_str(&status)
                .ok_or_else(|| conversion_error("status", &status))?,
            content_hash: row.get("content_hash")?,
            perceptual_hash: perceptual_hash.as_deref().map(decode_phash).transpose()?,
            committed_bytes: row
                .get::<_, Option<i64>>("committed_bytes")?
                .map(|v| v as u64),
            local_path: row.get("local_path")?,
            duplicate_of: row.get("duplicate_of")?,
            error: row.get("error")?,
            retry_count: row.get::<_, i64>("retry_count")? as u32,
            next_attempt_at: row.get("next_attempt_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_manifest(row: &Row) -> rusqlite::Result<Manifest> {
        let status: String = row.get("status")?;
        Ok(Manifest {
            id: row.get("id")?,
            source: row.get("source")?,
            external_ref: row.get("external_ref")?,
            status: ManifestStatus::from_db_str(&status)
                .ok_or_else(|| conversion_error("status", &status))?,
            retry_count: row.get::<_, i64>("retry_count")? as u32,
            candidates_created: row
                .get::<_, Option<i64>>("candidates_created")?
                .map(|v| v as u64),
            error: row.get("error")?,
            next_attempt_at: row.get("next_attempt_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn insert_candidate(conn: &Connection, seed: &CandidateSeed, now: i64) -> RegistryResult<bool> {
        // Discovery and queueing are a single step: new rows start as PENDING.
        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO candidates (
                id, source, external_ref, title, size_hint, width, height,
                status, retry_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)"#,
            params![
                Uuid::new_v4().to_string(),
                seed.source,
                seed.external_ref,
                seed.title,
                seed.size_hint.map(|v| v as i64),
                seed.width.map(i64::from),
                seed.height.map(i64::from),
                CandidateStatus::Pending.as_db_str(),
                now,
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Applies one validated candidate transition on `conn`.
    fn apply_transition(
        conn: &Connection,
        id: &str,
        to: CandidateStatus,
        update: &CandidateUpdate,
        now: i64,
    ) -> RegistryResult<()> {
        let (from, stored_hash, stored_phash) = conn
            .query_row(
                "SELECT status, content_hash, perceptual_hash FROM candidates WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let from = CandidateStatus::from_db_str(&from).ok_or_else(|| {
            RegistryError::Database(conversion_error("status", &from))
        })?;

        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: from.as_db_str(),
                to: to.as_db_str(),
            });
        }

        let (content_hash, perceptual_hash) = if to.requires_fingerprint() {
            let content_hash = update.content_hash.clone().or(stored_hash);
            let perceptual_hash = update.perceptual_hash.map(encode_phash).or(stored_phash);
            match (content_hash, perceptual_hash) {
                (Some(c), Some(p)) => (Some(c), Some(p)),
                _ => {
                    return Err(RegistryError::MissingFingerprint {
                        id: id.to_string(),
                        status: to.as_db_str(),
                    })
                }
            }
        } else {
            (None, None)
        };

        let retained = to == CandidateStatus::Downloaded;
        let is_duplicate = matches!(
            to,
            CandidateStatus::DuplicateExact | CandidateStatus::DuplicateNear
        );

        conn.execute(
            r#"UPDATE candidates SET
                status = ?2,
                content_hash = ?3,
                perceptual_hash = ?4,
                committed_bytes = ?5,
                local_path = ?6,
                duplicate_of = ?7,
                next_attempt_at = ?8,
                retry_count = retry_count + ?9,
                error = CASE WHEN ?10 THEN NULL ELSE COALESCE(?11, error) END,
                width = COALESCE(?12, width),
                height = COALESCE(?13, height),
                updated_at = ?14
               WHERE id = ?1"#,
            params![
                id,
                to.as_db_str(),
                content_hash,
                perceptual_hash,
                retained.then(|| update.committed_bytes.unwrap_or(0) as i64),
                if retained { update.local_path.clone() } else { None },
                if is_duplicate { update.duplicate_of.clone() } else { None },
                if to == CandidateStatus::Pending {
                    update.next_attempt_at
                } else {
                    None
                },
                i64::from(to == CandidateStatus::Failed),
                retained,
                update.error,
                update.width.map(i64::from),
                update.height.map(i64::from),
                now,
            ],
        )?;
        debug!("Candidate {} {} -> {}", id, from.as_db_str(), to.as_db_str());
        Ok(())
    }

    fn apply_manifest_transition(
        conn: &Connection,
        id: &str,
        to: ManifestStatus,
        update: &ManifestUpdate,
        now: i64,
    ) -> RegistryResult<()> {
        let from: String = conn
            .query_row("SELECT status FROM manifests WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let from = ManifestStatus::from_db_str(&from).ok_or_else(|| {
            RegistryError::Database(conversion_error("status", &from))
        })?;
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: from.as_db_str(),
                to: to.as_db_str(),
            });
        }

        conn.execute(
            r#"UPDATE manifests SET
                status = ?2,
                candidates_created = COALESCE(?3, candidates_created),
                next_attempt_at = ?4,
                retry_count = retry_count + ?5,
                error = CASE WHEN ?6 THEN NULL ELSE COALESCE(?7, error) END,
                updated_at = ?8
               WHERE id = ?1"#,
            params![
                id,
                to.as_db_str(),
                update.candidates_created.map(|v| v as i64),
                if to == ManifestStatus::Pending {
                    update.next_attempt_at
                } else {
                    None
                },
                i64::from(to == ManifestStatus::Failed),
                to == ManifestStatus::Expanded,
                update.error,
                now,
            ],
        )?;
        Ok(())
    }

    /// FAILED rows are only ever transient; settle any found at startup.
    fn resolve_failed(&self, table: &str, max_retries: u32) -> RegistryResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_millis();
        let exhausted = tx.execute(
            &format!(
                r#"UPDATE {} SET status = 'FAILED_PERMANENT', next_attempt_at = NULL, updated_at = ?1
                   WHERE status = 'FAILED' AND retry_count > ?2"#,
                table
            ),
            params![now, max_retries],
        )?;
        let requeued = tx.execute(
            &format!(
                r#"UPDATE {} SET status = 'PENDING', next_attempt_at = NULL, updated_at = ?1
                   WHERE status = 'FAILED'"#,
                table
            ),
            params![now],
        )?;
        tx.commit()?;
        Ok(exhausted + requeued)
    }

    fn count_by_source_and_status(&self, table: &str) -> RegistryResult<Vec<StatusCount>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT source, status, COUNT(*) FROM {} GROUP BY source, status ORDER BY source, status",
            table
        ))?;
        let counts = stmt
            .query_map([], |row| {
                Ok(StatusCount {
                    source: row.get(0)?,
                    status: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}

impl RegistryStore for SqliteRegistryStore {
    fn enqueue_candidate(&self, seed: &CandidateSeed) -> RegistryResult<bool> {
        let conn = self.conn();
        Self::insert_candidate(&conn, seed, now_millis())
    }

    fn enqueue_candidates(&self, seeds: &[CandidateSeed]) -> RegistryResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_millis();
        let mut inserted = 0;
        for seed in seeds {
            if Self::insert_candidate(&tx, seed, now)? {
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn get_candidate(&self, id: &str) -> RegistryResult<Option<Candidate>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT * FROM candidates WHERE id = ?1",
                [id],
                Self::row_to_candidate,
            )
            .optional()?)
    }

    fn find_candidate(
        &self,
        source: &str,
        external_ref: &str,
    ) -> RegistryResult<Option<Candidate>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT * FROM candidates WHERE source = ?1 AND external_ref = ?2",
                [source, external_ref],
                Self::row_to_candidate,
            )
            .optional()?)
    }

    fn list_candidates(
        &self,
        source: Option<&str>,
        status: Option<CandidateStatus>,
    ) -> RegistryResult<Vec<Candidate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM candidates
               WHERE (?1 IS NULL OR source = ?1) AND (?2 IS NULL OR status = ?2)
               ORDER BY created_at, rowid"#,
        )?;
        let candidates = stmt
            .query_map(
                params![source, status.map(|s| s.as_db_str())],
                Self::row_to_candidate,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }

    fn claim_next_pending(&self, source: &str) -> RegistryResult<Option<Candidate>> {
        let conn = self.conn();
        let claimed = conn
            .query_row(
                r#"UPDATE candidates SET status = ?3, updated_at = ?2
                   WHERE id = (
                       SELECT id FROM candidates
                       WHERE source = ?1 AND status = ?4
                         AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
                       ORDER BY created_at, rowid
                       LIMIT 1
                   )
                   RETURNING *"#,
                params![
                    source,
                    now_millis(),
                    CandidateStatus::Reserved.as_db_str(),
                    CandidateStatus::Pending.as_db_str(),
                ],
                Self::row_to_candidate,
            )
            .optional()?;
        Ok(claimed)
    }

    fn mark(
        &self,
        id: &str,
        status: CandidateStatus,
        update: CandidateUpdate,
    ) -> RegistryResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        Self::apply_transition(&tx, id, status, &update, now_millis())?;
        tx.commit()?;
        Ok(())
    }

    fn record_failure(
        &self,
        id: &str,
        error: &str,
        retry_at: Option<i64>,
    ) -> RegistryResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_millis();
        Self::apply_transition(&tx, id, CandidateStatus::Failed, &CandidateUpdate::error(error), now)?;
        match retry_at {
            Some(at) => Self::apply_transition(
                &tx,
                id,
                CandidateStatus::Pending,
                &CandidateUpdate::retry_at(at),
                now,
            )?,
            None => Self::apply_transition(
                &tx,
                id,
                CandidateStatus::FailedPermanent,
                &CandidateUpdate::default(),
                now,
            )?,
        }
        tx.commit()?;
        Ok(())
    }

    fn supersede(
        &self,
        old_id: &str,
        new_id: &str,
        update: CandidateUpdate,
    ) -> RegistryResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_millis();
        Self::apply_transition(&tx, new_id, CandidateStatus::Downloaded, &update, now)?;
        let demotion = CandidateUpdate {
            duplicate_of: Some(new_id.to_string()),
            ..Default::default()
        };
        Self::apply_transition(&tx, old_id, CandidateStatus::DuplicateNear, &demotion, now)?;
        tx.commit()?;
        Ok(())
    }

    fn requeue_stale(&self, max_age: Duration) -> RegistryResult<usize> {
        let conn = self.conn();
        let now = now_millis();
        let cutoff = now - max_age.as_millis() as i64;
        let requeued = conn.execute(
            r#"UPDATE candidates SET status = ?1, next_attempt_at = NULL, updated_at = ?2
               WHERE status IN (?3, ?4) AND updated_at <= ?5"#,
            params![
                CandidateStatus::Pending.as_db_str(),
                now,
                CandidateStatus::Reserved.as_db_str(),
                CandidateStatus::Fetching.as_db_str(),
                cutoff,
            ],
        )?;
        Ok(requeued)
    }

    fn requeue_failed(&self, max_retries: u32) -> RegistryResult<usize> {
        self.resolve_failed("candidates", max_retries)
    }

    fn reset_failed_permanent(&self, source: Option<&str>) -> RegistryResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_millis();
        let mut reset = 0;
        for table in ["candidates", "manifests"] {
            reset += tx.execute(
                &format!(
                    r#"UPDATE {} SET status = 'PENDING', retry_count = 0, error = NULL,
                           next_attempt_at = NULL, updated_at = ?1
                       WHERE status = 'FAILED_PERMANENT' AND (?2 IS NULL OR source = ?2)"#,
                    table
                ),
                params![now, source],
            )?;
        }
        tx.commit()?;
        Ok(reset)
    }

    fn committed_bytes(&self) -> RegistryResult<u64> {
        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(committed_bytes), 0) FROM candidates WHERE status = ?1",
            [CandidateStatus::Downloaded.as_db_str()],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    fn retained_fingerprints(&self) -> RegistryResult<Vec<RetainedFingerprint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT id, content_hash, perceptual_hash, width, height, committed_bytes, local_path
               FROM candidates WHERE status = ?1 ORDER BY created_at, rowid"#,
        )?;
        let rows = stmt
            .query_map([CandidateStatus::Downloaded.as_db_str()], |row| {
                let perceptual_hash: String = row.get(2)?;
                Ok(RetainedFingerprint {
                    id: row.get(0)?,
                    content_hash: row.get(1)?,
                    perceptual_hash: decode_phash(&perceptual_hash)?,
                    width: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u32,
                    height: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u32,
                    committed_bytes: row.get::<_, Option<i64>>(5)?.unwrap_or(0) as u64,
                    local_path: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn outstanding_work(&self, source: &str) -> RegistryResult<bool> {
        let conn = self.conn();
        let outstanding = conn.query_row(
            r#"SELECT EXISTS(
                   SELECT 1 FROM candidates WHERE source = ?1
                     AND status IN ('DISCOVERED', 'PENDING', 'RESERVED', 'FETCHING', 'FAILED')
               ) OR EXISTS(
                   SELECT 1 FROM manifests WHERE source = ?1
                     AND status IN ('DISCOVERED', 'PENDING', 'PROCESSING', 'FAILED')
               )"#,
            [source],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(outstanding)
    }

    fn status_counts(&self) -> RegistryResult<Vec<StatusCount>> {
        self.count_by_source_and_status("candidates")
    }

    fn enqueue_manifest(&self, seed: &ManifestSeed) -> RegistryResult<bool> {
        let conn = self.conn();
        let now = now_millis();
        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO manifests (
                id, source, external_ref, status, retry_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)"#,
            params![
                Uuid::new_v4().to_string(),
                seed.source,
                seed.external_ref,
                ManifestStatus::Pending.as_db_str(),
                now,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn get_manifest(&self, id: &str) -> RegistryResult<Option<Manifest>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT * FROM manifests WHERE id = ?1",
                [id],
                Self::row_to_manifest,
            )
            .optional()?)
    }

    fn claim_next_manifest(&self) -> RegistryResult<Option<Manifest>> {
        let conn = self.conn();
        let claimed = conn
            .query_row(
                r#"UPDATE manifests SET status = ?2, updated_at = ?1
                   WHERE id = (
                       SELECT id FROM manifests
                       WHERE status = ?3
                         AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                       ORDER BY created_at, rowid
                       LIMIT 1
                   )
                   RETURNING *"#,
                params![
                    now_millis(),
                    ManifestStatus::Processing.as_db_str(),
                    ManifestStatus::Pending.as_db_str(),
                ],
                Self::row_to_manifest,
            )
            .optional()?;
        Ok(claimed)
    }

    fn mark_manifest(
        &self,
        id: &str,
        status: ManifestStatus,
        update: ManifestUpdate,
    ) -> RegistryResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        Self::apply_manifest_transition(&tx, id, status, &update, now_millis())?;
        tx.commit()?;
        Ok(())
    }

    fn record_manifest_failure(
        &self,
        id: &str,
        error: &str,
        retry_at: Option<i64>,
    ) -> RegistryResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_millis();
        let failed = ManifestUpdate {
            error: Some(error.to_string()),
            ..Default::default()
        };
        Self::apply_manifest_transition(&tx, id, ManifestStatus::Failed, &failed, now)?;
        let (next, update) = match retry_at {
            Some(at) => (
                ManifestStatus::Pending,
                ManifestUpdate {
                    next_attempt_at: Some(at),
                    ..Default::default()
                },
            ),
            None => (ManifestStatus::FailedPermanent, ManifestUpdate::default()),
        };
        Self::apply_manifest_transition(&tx, id, next, &update, now)?;
        tx.commit()?;
        Ok(())
    }

    fn requeue_stale_manifests(&self, max_age: Duration) -> RegistryResult<usize> {
        let conn = self.conn();
        let now = now_millis();
        let cutoff = now - max_age.as_millis() as i64;
        let requeued = conn.execute(
            r#"UPDATE manifests SET status = ?1, next_attempt_at = NULL, updated_at = ?2
               WHERE status = ?3 AND updated_at <= ?4"#,
            params![
                ManifestStatus::Pending.as_db_str(),
                now,
                ManifestStatus::Processing.as_db_str(),
                cutoff,
            ],
        )?;
        Ok(requeued)
    }

    fn requeue_failed_manifests(&self, max_retries: u32) -> RegistryResult<usize> {
        self.resolve_failed("manifests", max_retries)
    }

    fn outstanding_manifests(&self) -> RegistryResult<bool> {
        let conn = self.conn();
        let outstanding = conn.query_row(
            r#"SELECT EXISTS(
                   SELECT 1 FROM manifests
                   WHERE status IN ('DISCOVERED', 'PENDING', 'PROCESSING', 'FAILED')
               )"#,
            [],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(outstanding)
    }

    fn manifest_status_counts(&self) -> RegistryResult<Vec<StatusCount>> {
        self.count_by_source_and_status("manifests")
    }
}

fn encode_phash(hash: u64) -> String {
    format!("{:016x}", hash)
}

fn decode_phash(hex: &str) -> rusqlite::Result<u64> {
    u64::from_str_radix(hex, 16).map_err(|_| conversion_error("perceptual_hash", hex))
}

fn conversion_error(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("invalid {} value '{}'", column, value).into(),
    )
}
