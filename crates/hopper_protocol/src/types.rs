//! Core job vocabulary: ids, canonical enums, and the job snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a bulk job. Caller-visible, allocated at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Allocate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Uuid::parse_str(s).map_err(|_| IdParseError::Job(s.to_string()))?;
        Ok(JobId(value))
    }
}

/// Identifier for a chunked upload session. Caller-supplied or server-generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Server-generated session id (UUID v4 text).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a record in the external record store.
///
/// Stored canonically as text: numeric ids render without quotes when they
/// came in as JSON numbers, so `from_value` accepts both shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Extract an id from a JSON field value. Strings and integers are
    /// accepted; everything else (including null) is no id at all.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Failed to parse a textual identifier.
#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("invalid job id: '{0}' is not a UUID")]
    Job(String),
}

// ============================================================================
// Records
// ============================================================================

/// One input or stored record: a JSON object. The engine never inspects
/// record internals beyond configured field names.
pub type Record = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Canonical Enums
// ============================================================================

/// Kind of bulk operation a job performs.
/// This is the CANONICAL definition - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Insert new records
    Create,
    /// Merge provided fields into existing records
    Update,
    /// Substitute whole payloads of existing records
    Replace,
    /// Remove records by identifier
    Delete,
    /// Create-or-update keyed on a unique-field set
    Upsert,
    /// Import chained into aggregate / score / generate stages
    Pipeline,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Create => "create",
            JobType::Update => "update",
            JobType::Replace => "replace",
            JobType::Delete => "delete",
            JobType::Upsert => "upsert",
            JobType::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(JobType::Create),
            "update" => Ok(JobType::Update),
            "replace" => Ok(JobType::Replace),
            "delete" => Ok(JobType::Delete),
            "upsert" => Ok(JobType::Upsert),
            "pipeline" => Ok(JobType::Pipeline),
            _ => Err(format!("Invalid job type: '{}'", s)),
        }
    }
}

/// Lifecycle state of a bulk job.
/// This is the CANONICAL definition - use this everywhere.
///
/// Legal transitions only move forward:
/// OPEN → UPLOAD_COMPLETE → IN_PROGRESS → JOB_COMPLETE, with FAILED reachable
/// from any non-terminal state on error and ABORTED from any non-terminal
/// state on caller request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Job created; input may still be uploaded
    #[default]
    Open,
    /// All input uploaded, awaiting a worker
    UploadComplete,
    /// A worker is executing batches
    InProgress,
    /// All batches done (terminal)
    JobComplete,
    /// Systemic failure ended the job (terminal)
    Failed,
    /// Caller aborted the job (terminal)
    Aborted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Open => "OPEN",
            JobState::UploadComplete => "UPLOAD_COMPLETE",
            JobState::InProgress => "IN_PROGRESS",
            JobState::JobComplete => "JOB_COMPLETE",
            JobState::Failed => "FAILED",
            JobState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::JobComplete | JobState::Failed | JobState::Aborted)
    }

    /// States from which `begin_processing` may claim the job.
    pub fn can_start(&self) -> bool {
        matches!(self, JobState::Open | JobState::UploadComplete)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(JobState::Open),
            "UPLOAD_COMPLETE" => Ok(JobState::UploadComplete),
            "IN_PROGRESS" => Ok(JobState::InProgress),
            "JOB_COMPLETE" => Ok(JobState::JobComplete),
            "FAILED" => Ok(JobState::Failed),
            "ABORTED" => Ok(JobState::Aborted),
            _ => Err(format!("Invalid job state: '{}'", s)),
        }
    }
}

/// Outcome bucket a record identifier lands in after execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Created,
    Updated,
    Deleted,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Created => "created",
            OutcomeKind::Updated => "updated",
            OutcomeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(OutcomeKind::Created),
            "updated" => Ok(OutcomeKind::Updated),
            "deleted" => Ok(OutcomeKind::Deleted),
            _ => Err(format!("Invalid outcome kind: '{}'", s)),
        }
    }
}

// ============================================================================
// Progress bookkeeping
// ============================================================================

/// One per-record error captured during execution. Append-only, ordered by
/// the item's position in the job input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub item_index: u64,
    pub message: String,
}

impl ErrorEntry {
    pub fn new(item_index: u64, message: impl Into<String>) -> Self {
        Self { item_index, message: message.into() }
    }
}

/// Record identifiers grouped by outcome kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultIds {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<RecordId>,
}

impl ResultIds {
    pub fn push(&mut self, kind: OutcomeKind, id: RecordId) {
        match kind {
            OutcomeKind::Created => self.created.push(id),
            OutcomeKind::Updated => self.updated.push(id),
            OutcomeKind::Deleted => self.deleted.push(id),
        }
    }

    pub fn merge(&mut self, other: ResultIds) {
        self.created.extend(other.created);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
    }

    pub fn created_count(&self) -> usize {
        self.created.len()
    }

    pub fn updated_count(&self) -> usize {
        self.updated.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// One atomic progress increment: counter deltas plus the errors and result
/// ids the batch produced. Applied in a single state-store write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressDelta {
    /// Records consumed from the input (success or error).
    pub processed: u64,
    /// Records applied to the record store.
    pub succeeded: u64,
    /// Records rejected per-record (validation, missing id, not found).
    pub failed: u64,
    /// Per-record errors, in input order.
    pub errors: Vec<ErrorEntry>,
    /// Result ids the batch produced.
    pub results: ResultIds,
}

impl ProgressDelta {
    pub fn is_empty(&self) -> bool {
        self.processed == 0
            && self.succeeded == 0
            && self.failed == 0
            && self.errors.is_empty()
            && self.results.is_empty()
    }
}

// ============================================================================
// Job snapshot
// ============================================================================

/// Read-only view of one job as stored. Counters are monotonic;
/// `completed_at` is set exactly once, at the terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub job_type: JobType,
    pub state: JobState,
    pub total_items: u64,
    pub processed_items: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub aggregates_ready: bool,
    pub aggregates_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub result_ids: ResultIds,
}

impl Job {
    /// Completion percentage, 0.0 when nothing was declared, two decimals.
    pub fn percentage(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        let raw = self.processed_items as f64 / self.total_items as f64 * 100.0;
        (raw * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_roundtrip() {
        for state in [
            JobState::Open,
            JobState::UploadComplete,
            JobState::InProgress,
            JobState::JobComplete,
            JobState::Failed,
            JobState::Aborted,
        ] {
            let parsed: JobState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
    }

    #[test]
    fn job_state_terminality() {
        assert!(!JobState::Open.is_terminal());
        assert!(!JobState::UploadComplete.is_terminal());
        assert!(!JobState::InProgress.is_terminal());
        assert!(JobState::JobComplete.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Aborted.is_terminal());

        assert!(JobState::Open.can_start());
        assert!(JobState::UploadComplete.can_start());
        assert!(!JobState::InProgress.can_start());
        assert!(!JobState::Failed.can_start());
    }

    #[test]
    fn job_type_parse_is_case_insensitive() {
        assert_eq!("UPSERT".parse::<JobType>().unwrap(), JobType::Upsert);
        assert_eq!("Pipeline".parse::<JobType>().unwrap(), JobType::Pipeline);
        assert!("merge".parse::<JobType>().is_err());
    }

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::generate();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn record_id_from_value() {
        assert_eq!(
            RecordId::from_value(&serde_json::json!("abc")),
            Some(RecordId::new("abc"))
        );
        assert_eq!(
            RecordId::from_value(&serde_json::json!(42)),
            Some(RecordId::new("42"))
        );
        assert_eq!(RecordId::from_value(&serde_json::json!(null)), None);
        assert_eq!(RecordId::from_value(&serde_json::json!("")), None);
        assert_eq!(RecordId::from_value(&serde_json::json!([1])), None);
    }

    #[test]
    fn percentage_rounds_to_two_decimals() {
        let mut job = sample_job();
        job.total_items = 3;
        job.processed_items = 1;
        assert_eq!(job.percentage(), 33.33);

        job.total_items = 0;
        job.processed_items = 0;
        assert_eq!(job.percentage(), 0.0);
    }

    #[test]
    fn result_ids_merge_and_counts() {
        let mut ids = ResultIds::default();
        ids.push(OutcomeKind::Created, RecordId::from(1));
        let mut other = ResultIds::default();
        other.push(OutcomeKind::Created, RecordId::from(2));
        other.push(OutcomeKind::Updated, RecordId::from(3));
        ids.merge(other);
        assert_eq!(ids.created_count(), 2);
        assert_eq!(ids.updated_count(), 1);
        assert_eq!(ids.deleted_count(), 0);
        assert!(!ids.is_empty());
    }

    fn sample_job() -> Job {
        Job {
            job_id: JobId::generate(),
            job_type: JobType::Create,
            state: JobState::Open,
            total_items: 0,
            processed_items: 0,
            success_count: 0,
            error_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            aggregates_ready: false,
            aggregates_completed: false,
            fail_reason: None,
            errors: Vec::new(),
            result_ids: ResultIds::default(),
        }
    }
}
