//! External collaborator seams: the record store and the per-record validator.
//!
//! The engine never speaks a concrete query language. Everything it needs
//! from the system of record is expressed through [`RecordStore`], and every
//! implementation (SQL, document store, in-memory test double) plugs in
//! behind it. Batch-level failures come back as [`StoreError`] and fail the
//! whole job; per-record problems are the executor's business and never
//! appear here.

use async_trait::async_trait;
use hopper_protocol::types::{Record, RecordId};
use thiserror::Error;

use crate::resolver::KeyTuple;

/// Record store call result type.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A record-store call failed as a whole (connectivity, backend rejection).
///
/// Implementations report whatever went wrong as an `anyhow::Error`; the
/// executor treats any `StoreError` as systemic and fails the job.
#[derive(Error, Debug)]
#[error("record store failure: {0}")]
pub struct StoreError(#[from] pub anyhow::Error);

impl StoreError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(err.into())
    }

    /// Build from a plain message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self(anyhow::anyhow!(msg.into()))
    }
}

/// One record as held by the record store: its identifier plus its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub fields: Record,
}

impl StoredRecord {
    pub fn new(id: RecordId, fields: Record) -> Self {
        Self { id, fields }
    }
}

/// One targeted write: the record to touch and the fields to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub id: RecordId,
    pub fields: Record,
}

impl RecordUpdate {
    pub fn new(id: RecordId, fields: Record) -> Self {
        Self { id, fields }
    }
}

/// Set-based access to the system of record.
///
/// Every method is one backend round-trip covering the whole slice it is
/// given; the executor sizes slices via its batch configuration. Write
/// methods report which entries actually landed so the executor can turn
/// the rest into per-record errors instead of losing them silently.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert new records, returning their assigned ids in input order.
    async fn bulk_insert(&self, records: Vec<Record>) -> StoreResult<Vec<RecordId>>;

    /// Merge the given fields into existing records. Returns one id per
    /// update that found its record, in input order; updates whose id did
    /// not exist are absent from the result.
    async fn bulk_update(&self, updates: Vec<RecordUpdate>) -> StoreResult<Vec<RecordId>>;

    /// Substitute whole records. Same missing-id contract as `bulk_update`.
    async fn bulk_replace(&self, updates: Vec<RecordUpdate>) -> StoreResult<Vec<RecordId>>;

    /// Delete by id. Returns one id per entry that existed and was removed,
    /// in input order.
    async fn bulk_delete(&self, ids: Vec<RecordId>) -> StoreResult<Vec<RecordId>>;

    /// The resolver's single lookup: every stored record whose unique-field
    /// tuple matches any of the candidate keys.
    async fn find_by_any(
        &self,
        fields: &[String],
        keys: &[KeyTuple],
    ) -> StoreResult<Vec<StoredRecord>>;

    /// Fetch records by id, in input order. Unknown ids are silently absent.
    async fn fetch(&self, ids: &[RecordId]) -> StoreResult<Vec<StoredRecord>>;
}

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field '{field}': {message}")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

/// Per-record validation seam, applied to create-path records.
///
/// A non-empty result marks the record as failed on the job's error log;
/// it never aborts the batch or the job.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, record: &Record) -> Vec<FieldError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_carries_backend_message() {
        let err = StoreError::msg("connection refused");
        assert_eq!(err.to_string(), "record store failure: connection refused");

        let wrapped = StoreError::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "socket timeout",
        ));
        assert!(wrapped.to_string().contains("socket timeout"));
    }

    #[test]
    fn test_field_error_display() {
        let err = FieldError::new("amount", "required field is missing");
        assert_eq!(err.to_string(), "field 'amount': required field is missing");
    }
}
