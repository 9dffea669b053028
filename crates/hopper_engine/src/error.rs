//! Error types for the engine layer.

use hopper_state::StateError;
use thiserror::Error;

use crate::store::StoreError;

/// Engine operation result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine operations.
///
/// Per-record problems (validation, missing identifiers) never appear here;
/// they land on the job's error log and are reported through the job status.
#[derive(Error, Debug)]
pub enum EngineError {
    /// State store failure, including session protocol violations.
    #[error(transparent)]
    State(#[from] StateError),

    /// The record store failed a whole batch call.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A scoring or offer model failed for a group.
    #[error("model failure: {0}")]
    Model(#[from] anyhow::Error),

    /// Operation requires a state the job is not in.
    #[error("State conflict: {0}")]
    Conflict(String),

    /// Job or report not found (possibly expired).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The submission itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}
