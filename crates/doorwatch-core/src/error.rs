//! # Error Types
//!
//! Domain-specific error types for doorwatch-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  doorwatch-core    CoreError     - malformed domain values              │
//! │  doorwatch-db      DbError       - storage failures                     │
//! │  doorwatch-engine  EngineError   - persistence failure on append        │
//! │  doorwatch-sync    SyncError     - transport / protocol / config        │
//! │                                                                         │
//! │  Rejected transitions and suppressed duplicates are OUTCOMES, not       │
//! │  errors: they never travel through these types.                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Core domain errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// An event type string was blank.
    #[error("Event type must not be empty")]
    EmptyEventType,

    /// A duration setting could not be interpreted.
    #[error("Invalid escalation duration: {0}")]
    InvalidDuration(String),
}
