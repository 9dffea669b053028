//! Caller-facing payload shapes: status polling, submission acks, chunked
//! upload requests, and the upsert options block.
//!
//! These are the JSON bodies an embedding service exchanges with its callers.
//! Routing, auth, and transport stay outside the engine.

use serde::{Deserialize, Serialize};

use crate::pipeline::{AggregateConfig, CreditModelConfig};
use crate::types::{ErrorEntry, Job, JobId, JobState, JobType, Record, ResultIds, SessionId};

// ============================================================================
// Job status
// ============================================================================

/// Poll response for one job. Mirrors the stored snapshot plus the derived
/// completion percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub job_type: JobType,
    pub state: JobState,
    pub total_items: u64,
    pub processed_items: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub percentage: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub aggregates_ready: bool,
    pub aggregates_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub result_ids: ResultIds,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            job_type: job.job_type,
            state: job.state,
            total_items: job.total_items,
            processed_items: job.processed_items,
            success_count: job.success_count,
            error_count: job.error_count,
            percentage: job.percentage(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            aggregates_ready: job.aggregates_ready,
            aggregates_completed: job.aggregates_completed,
            fail_reason: job.fail_reason.clone(),
            errors: job.errors.clone(),
            result_ids: job.result_ids.clone(),
        }
    }
}

/// Where a caller polls a job. Embedders mount the engine under their own
/// prefix; this is the canonical relative path.
pub fn status_url(job_id: &JobId) -> String {
    format!("/jobs/{}/status", job_id)
}

// ============================================================================
// Submission
// ============================================================================

/// Ack for an asynchronously executed submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub total_items: u64,
    pub status_url: String,
}

impl JobHandle {
    pub fn for_job(job_id: JobId, total_items: u64) -> Self {
        let status_url = status_url(&job_id);
        Self { job_id, total_items, status_url }
    }
}

/// Final tally of one bulk operation, also the synchronous-path response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationReport {
    pub total_items: u64,
    pub success_count: u64,
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub result_ids: ResultIds,
}

impl OperationReport {
    pub fn created_count(&self) -> usize {
        self.result_ids.created_count()
    }

    pub fn updated_count(&self) -> usize {
        self.result_ids.updated_count()
    }

    pub fn deleted_count(&self) -> usize {
        self.result_ids.deleted_count()
    }
}

/// What a submission returned: the finished report (small inputs run inline)
/// or a handle to poll (large inputs become a job).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SubmitOutcome {
    Completed(OperationReport),
    Accepted(JobHandle),
}

impl SubmitOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            SubmitOutcome::Completed(_) => None,
            SubmitOutcome::Accepted(handle) => Some(handle.job_id),
        }
    }
}

/// Upsert matching options. `unique_fields` is mandatory for upsert;
/// `update_fields` defaults to every field present on the first record minus
/// the unique fields minus the identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertOptions {
    pub unique_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_fields: Option<Vec<String>>,
}

impl UpsertOptions {
    pub fn new(unique_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            unique_fields: unique_fields.into_iter().map(Into::into).collect(),
            update_fields: None,
        }
    }

    pub fn with_update_fields(
        mut self,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.update_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

// ============================================================================
// Chunked upload
// ============================================================================

fn default_chunk_job_type() -> JobType {
    JobType::Pipeline
}

/// One fragment of a chunked submission. The first chunk to arrive fixes
/// `total_chunks` for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSubmission {
    pub session_id: SessionId,
    /// 1-based position of this fragment in the full payload.
    pub chunk_number: u32,
    pub total_chunks: u32,
    pub chunk_data: Vec<Record>,
    /// What to run once assembled. Chunked ingestion feeds imports, either
    /// plain create or the full pipeline.
    #[serde(default = "default_chunk_job_type")]
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_model_config: Option<CreditModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_config: Option<AggregateConfig>,
}

/// Response to one chunk submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ChunkAck {
    /// More chunks outstanding. `next_chunk` is the lowest missing number.
    Partial {
        progress_percent: f64,
        received_chunks: u32,
        total_chunks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_chunk: Option<u32>,
    },
    /// Final chunk arrived; assembly ran and a job was started.
    Complete {
        job_id: JobId,
        total_items: u64,
        status_url: String,
    },
}

// ============================================================================
// Errors
// ============================================================================

/// Uniform error body for caller-facing failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into(), details: None }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
