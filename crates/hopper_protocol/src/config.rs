//! Engine configuration. Plain data, no ambient singleton: construct one and
//! hand it to the engine at startup.

use serde::{Deserialize, Serialize};

/// Records per store round-trip group.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;
/// Inputs at or below this size run inline and return synchronously.
pub const DEFAULT_SYNC_THRESHOLD: usize = 50;
/// Progress is persisted every this many processed items within a batch.
pub const DEFAULT_PROGRESS_STRIDE: u64 = 10;
/// Hard cap on records accepted into one job.
pub const DEFAULT_MAX_RECORDS_PER_JOB: usize = 1_000_000;
/// Finished/stale jobs expire after this long.
pub const DEFAULT_JOB_TTL_SECS: i64 = 86_400;
/// Incomplete upload sessions expire after this long.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3_600;
/// Expired-session tombstones linger this long so late chunks fail loudly.
pub const DEFAULT_SESSION_TOMBSTONE_TTL_SECS: i64 = 86_400;
/// Concurrent workers draining the task queue.
pub const DEFAULT_WORKERS: usize = 4;
/// Record field treated as the identifier.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Tunables for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub sync_threshold: usize,
    pub progress_stride: u64,
    pub max_records_per_job: usize,
    /// Field name that carries a record's identifier.
    pub id_field: String,
    pub job_ttl_secs: i64,
    pub session_ttl_secs: i64,
    pub session_tombstone_ttl_secs: i64,
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sync_threshold: DEFAULT_SYNC_THRESHOLD,
            progress_stride: DEFAULT_PROGRESS_STRIDE,
            max_records_per_job: DEFAULT_MAX_RECORDS_PER_JOB,
            id_field: DEFAULT_ID_FIELD.to_string(),
            job_ttl_secs: DEFAULT_JOB_TTL_SECS,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            session_tombstone_ttl_secs: DEFAULT_SESSION_TOMBSTONE_TTL_SECS,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl EngineConfig {
    /// Clamp nonsensical values instead of failing construction: a zero batch
    /// size or worker count would deadlock the engine.
    pub fn normalized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = 1;
        }
        if self.workers == 0 {
            self.workers = 1;
        }
        if self.progress_stride == 0 {
            self.progress_stride = 1;
        }
        self
    }
}
