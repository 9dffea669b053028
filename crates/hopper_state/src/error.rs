//! Error types for the state layer.

use thiserror::Error;

/// State store operation result type.
pub type Result<T> = std::result::Result<T, StateError>;

/// State store errors.
#[derive(Error, Debug)]
pub enum StateError {
    /// SQLx error (connection, query, etc.)
    #[error("State store error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Job or report not found (possibly expired)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation requires a state the job is not in
    #[error("State conflict: {0}")]
    Conflict(String),

    /// Serialization error (JSON columns)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored value failed to parse (corrupt row)
    #[error("Corrupt state: {0}")]
    Corrupt(String),

    /// Chunk session protocol violation
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl StateError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Protocol violations on a chunked upload session. Surfaced to the uploader
/// immediately; never touches any job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A later chunk declared a different total than the session was opened with.
    #[error(
        "total_chunks mismatch for session '{session_id}': session expects {expected}, chunk declared {declared}"
    )]
    TotalChunksMismatch {
        session_id: String,
        expected: u32,
        declared: u32,
    },

    /// Chunk number outside 1..=total_chunks.
    #[error(
        "chunk_number {chunk_number} out of range for session '{session_id}' (valid: 1..={total_chunks})"
    )]
    ChunkOutOfRange {
        session_id: String,
        chunk_number: u32,
        total_chunks: u32,
    },

    /// total_chunks must be at least 1.
    #[error("total_chunks must be >= 1 for session '{0}'")]
    ZeroChunks(String),

    /// The session already assembled; its payload was handed off.
    #[error("upload session '{0}' is already complete")]
    AlreadyComplete(String),

    /// The session TTL passed before all chunks arrived. Earlier fragments
    /// are gone; the uploader must restart under a new session id.
    #[error("upload session '{0}' expired; restart the upload under a new session id")]
    Expired(String),
}
