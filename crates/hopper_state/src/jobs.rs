//! Job lifecycle operations: creation, compare-and-swap transitions, atomic
//! progress counters, staged input, and pipeline reports.
//!
//! Every transition is a guarded UPDATE; `rows_affected == 0` means the
//! guard did not hold and the caller gets `Transition::Refused` with the
//! state that actually held. Two workers racing the same step therefore
//! resolve cleanly: one applies, the other observes the result.

use crate::error::{Result, StateError};
use crate::StateStore;
use hopper_protocol::pipeline::PipelineReport;
use hopper_protocol::types::{
    ErrorEntry, Job, JobId, JobState, JobType, OutcomeKind, ProgressDelta, Record, ResultIds,
};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Outcome of a compare-and-swap transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The guard held and the transition applied.
    Applied,
    /// The job was already past (or not yet at) this step; nothing changed.
    Refused {
        /// State observed after the refusal.
        current: JobState,
    },
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }

    pub fn refused_state(&self) -> Option<JobState> {
        match self {
            Transition::Applied => None,
            Transition::Refused { current } => Some(*current),
        }
    }
}

impl StateStore {
    // ========================================================================
    // Creation & snapshots
    // ========================================================================

    /// Allocate a job in OPEN state. Fails only if the store is unavailable.
    ///
    /// The returned snapshot is built from the insert itself rather than a
    /// read-back, so creation succeeds even with a TTL that has already
    /// lapsed (the job then simply reads as NotFound afterwards).
    pub async fn create_job(
        &self,
        job_type: JobType,
        total_items: u64,
        ttl_secs: i64,
    ) -> Result<Job> {
        let job_id = JobId::generate();
        let now = Self::now_millis();
        let expires_at = now + ttl_secs.saturating_mul(1000);

        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, job_type, state, total_items, created_at, updated_at, expires_at)
            VALUES (?, ?, 'OPEN', ?, ?, ?, ?)
            "#,
        )
        .bind(job_id.to_string())
        .bind(job_type.as_str())
        .bind(total_items as i64)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        info!(job_id = %job_id, job_type = %job_type, total_items, "Job created");

        Ok(Job {
            job_id,
            job_type,
            state: JobState::Open,
            total_items,
            processed_items: 0,
            success_count: 0,
            error_count: 0,
            created_at: Self::millis_to_datetime(now),
            updated_at: Self::millis_to_datetime(now),
            completed_at: None,
            aggregates_ready: false,
            aggregates_completed: false,
            fail_reason: None,
            errors: Vec::new(),
            result_ids: ResultIds::default(),
        })
    }

    /// Full snapshot of one job, including accumulated errors and result ids.
    ///
    /// A job past its TTL reads as NotFound even before the purge sweep
    /// physically removes it.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ? AND expires_at > ?")
            .bind(job_id.to_string())
            .bind(Self::now_millis())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                StateError::not_found(format!("job {} not found (may have expired)", job_id))
            })?;

        let errors = sqlx::query(
            "SELECT item_index, message FROM job_errors WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| ErrorEntry::new(r.get::<i64, _>("item_index") as u64, r.get::<String, _>("message")))
        .collect();

        let mut result_ids = ResultIds::default();
        let result_rows =
            sqlx::query("SELECT kind, record_id FROM job_results WHERE job_id = ? ORDER BY id ASC")
                .bind(job_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        for r in &result_rows {
            let kind_str: String = r.get("kind");
            let kind = OutcomeKind::from_str(&kind_str)
                .map_err(|_| StateError::Corrupt(format!("unknown outcome kind '{kind_str}'")))?;
            result_ids.push(kind, r.get::<String, _>("record_id").into());
        }

        Self::row_to_job(&row, errors, result_ids)
    }

    /// Current state only. Cheaper than a full snapshot; used by workers
    /// between batches for the advisory abort check.
    pub async fn get_job_state(&self, job_id: &JobId) -> Result<JobState> {
        let row = sqlx::query("SELECT state FROM jobs WHERE job_id = ? AND expires_at > ?")
            .bind(job_id.to_string())
            .bind(Self::now_millis())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                StateError::not_found(format!("job {} not found (may have expired)", job_id))
            })?;
        Self::parse_state(&row.get::<String, _>("state"))
    }

    // ========================================================================
    // Transitions (compare-and-swap)
    // ========================================================================

    /// OPEN/UPLOAD_COMPLETE → IN_PROGRESS. Refused when already claimed or
    /// terminal, so a retried/duplicate task delivery cannot double-start.
    pub async fn begin_processing(&self, job_id: &JobId) -> Result<Transition> {
        let now = Self::now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'IN_PROGRESS', updated_at = ?
            WHERE job_id = ? AND state IN ('OPEN', 'UPLOAD_COMPLETE')
            "#,
        )
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.refusal(job_id, "begin_processing").await;
        }

        info!(job_id = %job_id, "Job processing started");
        Ok(Transition::Applied)
    }

    /// Atomically apply one progress increment: counters bump in a single
    /// guarded UPDATE (never read-then-write), errors and result ids append
    /// in the same transaction. Only an IN_PROGRESS job accepts progress;
    /// late increments after a terminal transition are dropped so terminal
    /// snapshots stay frozen.
    pub async fn record_progress(
        &self,
        job_id: &JobId,
        delta: &ProgressDelta,
    ) -> Result<Transition> {
        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                processed_items = processed_items + ?,
                success_count = success_count + ?,
                error_count = error_count + ?,
                updated_at = ?
            WHERE job_id = ? AND state = 'IN_PROGRESS'
            "#,
        )
        .bind(delta.processed as i64)
        .bind(delta.succeeded as i64)
        .bind(delta.failed as i64)
        .bind(now)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return self.refusal(job_id, "record_progress").await;
        }

        for entry in &delta.errors {
            sqlx::query("INSERT INTO job_errors (job_id, item_index, message) VALUES (?, ?, ?)")
                .bind(job_id.to_string())
                .bind(entry.item_index as i64)
                .bind(&entry.message)
                .execute(&mut *tx)
                .await?;
        }

        Self::append_result_rows(&mut tx, job_id, &delta.results).await?;

        tx.commit().await?;

        debug!(
            job_id = %job_id,
            processed = delta.processed,
            succeeded = delta.succeeded,
            failed = delta.failed,
            "Progress recorded"
        );
        Ok(Transition::Applied)
    }

    /// IN_PROGRESS → JOB_COMPLETE. Sets `completed_at` exactly once, flips
    /// `aggregates_ready`, and appends any final result ids.
    pub async fn complete(&self, job_id: &JobId, result_ids: ResultIds) -> Result<Transition> {
        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'JOB_COMPLETE',
                completed_at = ?,
                updated_at = ?,
                aggregates_ready = 1
            WHERE job_id = ? AND state = 'IN_PROGRESS'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return self.refusal(job_id, "complete").await;
        }

        Self::append_result_rows(&mut tx, job_id, &result_ids).await?;

        tx.commit().await?;

        info!(job_id = %job_id, "Job complete");
        Ok(Transition::Applied)
    }

    /// Any non-terminal state → FAILED. Counters and result ids accumulated
    /// so far stay in place; `aggregates_ready` stays false.
    pub async fn fail(&self, job_id: &JobId, reason: &str) -> Result<Transition> {
        let now = Self::now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'FAILED',
                completed_at = ?,
                updated_at = ?,
                fail_reason = ?
            WHERE job_id = ? AND state IN ('OPEN', 'UPLOAD_COMPLETE', 'IN_PROGRESS')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(reason)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.refusal(job_id, "fail").await;
        }

        warn!(job_id = %job_id, reason, "Job failed");
        Ok(Transition::Applied)
    }

    /// Any non-terminal state → ABORTED. Advisory: workers notice between
    /// batches and stop; in-flight batches run to completion.
    pub async fn abort(&self, job_id: &JobId) -> Result<Transition> {
        let now = Self::now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'ABORTED', completed_at = ?, updated_at = ?
            WHERE job_id = ? AND state IN ('OPEN', 'UPLOAD_COMPLETE', 'IN_PROGRESS')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.refusal(job_id, "abort").await;
        }

        info!(job_id = %job_id, "Job aborted");
        Ok(Transition::Applied)
    }

    // ========================================================================
    // Staged input (OPEN → UPLOAD_COMPLETE flow)
    // ========================================================================

    /// Append an input batch to an OPEN job and grow `total_items`.
    /// Appending to a job in any other state is a caller error.
    pub async fn append_input(&self, job_id: &JobId, records: &[Record]) -> Result<u64> {
        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE jobs SET total_items = total_items + ?, updated_at = ? WHERE job_id = ? AND state = 'OPEN'",
        )
        .bind(records.len() as i64)
        .bind(now)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let current = self.current_state(job_id).await?;
            return Err(StateError::conflict(format!(
                "cannot append input to job {} in state {} (must be OPEN)",
                job_id, current
            )));
        }

        sqlx::query("INSERT INTO job_input (job_id, records) VALUES (?, ?)")
            .bind(job_id.to_string())
            .bind(serde_json::to_string(records)?)
            .execute(&mut *tx)
            .await?;

        let total: i64 = sqlx::query("SELECT total_items FROM jobs WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_one(&mut *tx)
            .await?
            .get("total_items");

        tx.commit().await?;

        debug!(job_id = %job_id, appended = records.len(), total_items = total, "Input appended");
        Ok(total as u64)
    }

    /// OPEN → UPLOAD_COMPLETE: the caller finished uploading input.
    pub async fn seal_upload(&self, job_id: &JobId) -> Result<Transition> {
        let now = Self::now_millis();
        let result = sqlx::query(
            "UPDATE jobs SET state = 'UPLOAD_COMPLETE', updated_at = ? WHERE job_id = ? AND state = 'OPEN'",
        )
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.refusal(job_id, "seal_upload").await;
        }

        info!(job_id = %job_id, "Upload sealed");
        Ok(Transition::Applied)
    }

    /// Load staged input batches in append order.
    pub async fn load_input(&self, job_id: &JobId) -> Result<Vec<Record>> {
        let rows = sqlx::query("SELECT records FROM job_input WHERE job_id = ? ORDER BY id ASC")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::new();
        for row in &rows {
            let batch: Vec<Record> = serde_json::from_str(&row.get::<String, _>("records"))?;
            records.extend(batch);
        }
        Ok(records)
    }

    // ========================================================================
    // Aggregates & pipeline reports
    // ========================================================================

    /// Flip `aggregates_completed`, exactly once: requires JOB_COMPLETE with
    /// `aggregates_ready` set and `aggregates_completed` still clear, so the
    /// flag can never go true twice or on a job that failed its import.
    pub async fn mark_aggregates_completed(&self, job_id: &JobId) -> Result<Transition> {
        let now = Self::now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET aggregates_completed = 1, updated_at = ?
            WHERE job_id = ?
              AND state = 'JOB_COMPLETE'
              AND aggregates_ready = 1
              AND aggregates_completed = 0
            "#,
        )
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.refusal(job_id, "mark_aggregates_completed").await;
        }

        info!(job_id = %job_id, "Aggregates completed");
        Ok(Transition::Applied)
    }

    /// Persist the pipeline report for a job (idempotent overwrite).
    pub async fn store_pipeline_report(
        &self,
        job_id: &JobId,
        report: &PipelineReport,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO pipeline_reports (job_id, report, created_at) VALUES (?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(serde_json::to_string(report)?)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch the stored pipeline report, if the job has produced one.
    pub async fn get_pipeline_report(&self, job_id: &JobId) -> Result<Option<PipelineReport>> {
        let row = sqlx::query("SELECT report FROM pipeline_reports WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.get::<String, _>("report"))?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // TTL expiry
    // ========================================================================

    /// Delete jobs past their TTL together with their errors, results, staged
    /// input, and reports. Returns the number of jobs removed.
    pub async fn purge_expired_jobs(&self) -> Result<u64> {
        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        for table in ["job_errors", "job_results", "job_input", "pipeline_reports"] {
            let sql = format!(
                "DELETE FROM {table} WHERE job_id IN (SELECT job_id FROM jobs WHERE expires_at <= ?)"
            );
            sqlx::query(&sql).bind(now).execute(&mut *tx).await?;
        }

        let result = sqlx::query("DELETE FROM jobs WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(purged, "Expired jobs purged");
        }
        Ok(purged)
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    async fn append_result_rows(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        job_id: &JobId,
        results: &ResultIds,
    ) -> Result<()> {
        let groups = [
            (OutcomeKind::Created, &results.created),
            (OutcomeKind::Updated, &results.updated),
            (OutcomeKind::Deleted, &results.deleted),
        ];
        for (kind, ids) in groups {
            for id in ids {
                sqlx::query("INSERT INTO job_results (job_id, kind, record_id) VALUES (?, ?, ?)")
                    .bind(job_id.to_string())
                    .bind(kind.as_str())
                    .bind(id.as_str())
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }

    /// Build the Refused outcome after a guarded UPDATE matched no row.
    async fn refusal(&self, job_id: &JobId, op: &str) -> Result<Transition> {
        let current = self.current_state(job_id).await?;
        debug!(job_id = %job_id, op, current = %current, "Transition refused");
        Ok(Transition::Refused { current })
    }

    async fn current_state(&self, job_id: &JobId) -> Result<JobState> {
        let row = sqlx::query("SELECT state FROM jobs WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                StateError::not_found(format!("job {} not found (may have expired)", job_id))
            })?;
        Self::parse_state(&row.get::<String, _>("state"))
    }

    fn parse_state(value: &str) -> Result<JobState> {
        JobState::from_str(value)
            .map_err(|_| StateError::Corrupt(format!("unknown job state '{value}'")))
    }

    fn row_to_job(
        row: &sqlx::sqlite::SqliteRow,
        errors: Vec<ErrorEntry>,
        result_ids: ResultIds,
    ) -> Result<Job> {
        let state = Self::parse_state(&row.get::<String, _>("state"))?;
        let type_str: String = row.get("job_type");
        let job_type = JobType::from_str(&type_str)
            .map_err(|_| StateError::Corrupt(format!("unknown job type '{type_str}'")))?;
        let id_str: String = row.get("job_id");
        let job_id = JobId::from_str(&id_str)
            .map_err(|_| StateError::Corrupt(format!("malformed job id '{id_str}'")))?;

        Ok(Job {
            job_id,
            job_type,
            state,
            total_items: row.get::<i64, _>("total_items") as u64,
            processed_items: row.get::<i64, _>("processed_items") as u64,
            success_count: row.get::<i64, _>("success_count") as u64,
            error_count: row.get::<i64, _>("error_count") as u64,
            created_at: Self::millis_to_datetime(row.get("created_at")),
            updated_at: Self::millis_to_datetime(row.get("updated_at")),
            completed_at: row
                .get::<Option<i64>, _>("completed_at")
                .map(Self::millis_to_datetime),
            aggregates_ready: row.get::<i64, _>("aggregates_ready") != 0,
            aggregates_completed: row.get::<i64, _>("aggregates_completed") != 0,
            fail_reason: row.get("fail_reason"),
            errors,
            result_ids,
        })
    }
}
