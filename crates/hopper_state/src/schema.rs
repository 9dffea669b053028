//! Schema creation for all Hopper state tables.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::StateStore;
use tracing::info;

impl StateStore {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // Enable WAL mode for better concurrent access
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        self.create_job_tables().await?;
        self.create_session_tables().await?;

        info!("State store schema verified");
        Ok(())
    }

    /// Create job lifecycle tables.
    async fn create_job_tables(&self) -> Result<()> {
        // Jobs: one row per bulk operation, counters updated in place
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'OPEN',
                total_items INTEGER NOT NULL DEFAULT 0,
                processed_items INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER,
                aggregates_ready INTEGER NOT NULL DEFAULT 0,
                aggregates_completed INTEGER NOT NULL DEFAULT 0,
                fail_reason TEXT,
                expires_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_expires ON jobs(expires_at)")
            .execute(&self.pool)
            .await?;

        // Per-record errors: append-only, ordered by insertion
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS job_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                item_index INTEGER NOT NULL,
                message TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_errors_job ON job_errors(job_id)")
            .execute(&self.pool)
            .await?;

        // Result ids: one row per affected record, grouped by outcome kind
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS job_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                record_id TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_results_job ON job_results(job_id)")
            .execute(&self.pool)
            .await?;

        // Staged input: batches appended while the job is OPEN
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS job_input (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                records TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_input_job ON job_input(job_id)")
            .execute(&self.pool)
            .await?;

        // Pipeline reports: one JSON document per pipeline job
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS pipeline_reports (
                job_id TEXT PRIMARY KEY,
                report TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create chunked upload session tables.
    async fn create_session_tables(&self) -> Result<()> {
        // Sessions: 'open' while receiving, 'assembled' after hand-off,
        // 'expired' tombstones reject late chunks loudly
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS upload_sessions (
                session_id TEXT PRIMARY KEY,
                total_chunks INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'open',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_expires ON upload_sessions(expires_at)")
            .execute(&self.pool)
            .await?;

        // Fragments: primary key makes duplicate chunk numbers overwrite
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS upload_chunks (
                session_id TEXT NOT NULL,
                chunk_number INTEGER NOT NULL,
                payload TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, chunk_number)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
