//! Error taxonomy for the task-orchestration core.
//!
//! Only `ValidationError`, `DuplicateError`, and `NotFoundError` are meant
//! to cross the public API boundary (§7). The remaining variants are
//! recorded on WorkItem/Job status and the metrics snapshot rather than
//! propagated to callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate work item: an equivalent live item already exists (id={existing_id})")]
    Duplicate { existing_id: String },

    #[error("not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("overlap conflict on {id}: {detail}")]
    OverlapConflict { id: String, detail: String },

    #[error("worker pool overloaded: queue depth {depth} exceeds {max}")]
    Overloaded { depth: usize, max: usize },

    #[error("timeout after {elapsed_ms}ms (deadline {deadline_ms}ms)")]
    Timeout { elapsed_ms: u64, deadline_ms: u64 },

    #[error("transient worker error: {0}")]
    TransientWorker(String),

    #[error("fatal worker error: {0}")]
    FatalWorker(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Whether this error kind is retryable by the originating subsystem.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::TransientWorker(_) | CoreError::Timeout { .. } | CoreError::Overloaded { .. }
        )
    }
}
