//! # Engine Error Types
//!
//! Only genuine failures travel through [`EngineError`]. Rejected transitions
//! and suppressed duplicates are ordinary outcomes
//! ([`SubmitOutcome`](crate::SubmitOutcome), [`AppendOutcome`](crate::AppendOutcome)).

use thiserror::Error;

use doorwatch_db::DbError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The event could not be persisted; nothing was broadcast for it.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] DbError),

    /// A requested escalation duration is not a positive, finite number.
    #[error("Invalid escalation duration: {0}")]
    InvalidDuration(String),

    /// The monitor task is gone.
    #[error("Monitor is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// True for failures that reached storage.
    pub fn is_persistence(&self) -> bool {
        matches!(self, EngineError::Persistence(_))
    }
}
