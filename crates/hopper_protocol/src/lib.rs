//! Shared vocabulary for the Hopper bulk processing engine.
//!
//! Everything callers and engine crates agree on lives here: job ids and
//! lifecycle enums, record/payload shapes, caller-facing request/response
//! bodies, pipeline stage configuration, and the engine configuration block.
//! No I/O and no runtime dependencies - types only.

pub mod api;
pub mod config;
pub mod pipeline;
pub mod types;

// Re-export types for convenience
pub use api::{
    ChunkAck,
    ChunkSubmission,
    ErrorResponse,
    JobHandle,
    JobStatusResponse,
    OperationReport,
    SubmitOutcome,
    UpsertOptions,
    status_url,
};
pub use config::EngineConfig;
pub use pipeline::{
    AggregateConfig,
    AggregateGroup,
    CreditModelConfig,
    Offer,
    PipelineReport,
    PipelineSummary,
    RiskLevel,
    ScoreResult,
    ScoreWeights,
};
pub use types::{
    ErrorEntry,
    // Snapshot
    Job,
    // Identifiers
    JobId,
    // Canonical enums (use these everywhere)
    JobState,
    JobType,
    OutcomeKind,
    ProgressDelta,
    Record,
    RecordId,
    ResultIds,
    SessionId,
};
