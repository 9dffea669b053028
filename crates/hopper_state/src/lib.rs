//! Durable state for Hopper: jobs, their counters and results, staged input,
//! chunked upload sessions, and pipeline reports.
//!
//! This crate is the single source of truth for job lifecycle state. All
//! transitions go through compare-and-swap updates and all counters through
//! atomic increments, so concurrent workers sharing a job never race.
//!
//! # Usage
//!
//! ```rust,ignore
//! use hopper_state::{StateStore, Result};
//!
//! let store = StateStore::open("hopper_state.sqlite3").await?;
//! let job = store.create_job(JobType::Create, 5_000, 86_400).await?;
//! store.begin_processing(&job.job_id).await?;
//! ```

mod error;
mod schema;

// Method implementations organized by domain
mod jobs;
mod sessions;

pub use error::{Result, SessionError, StateError};
pub use jobs::Transition;
pub use sessions::{ChunkIngest, SessionPurge};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Durable store for all Hopper state.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open or create a store at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        info!(path = %path.display(), "State store opened");

        Ok(store)
    }

    /// In-memory store for tests and embedders that don't need durability.
    ///
    /// Pinned to a single connection: every connection to `:memory:` is its
    /// own database, so the pool must never rotate it out.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        Ok(store)
    }

    /// Get the underlying connection pool (escape hatch for complex queries).
    ///
    /// Prefer using the typed methods instead.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the store.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl StateStore {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}
