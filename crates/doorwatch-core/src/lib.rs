//! # doorwatch-core: Pure Domain Model for Doorwatch
//!
//! This crate is the **heart** of Doorwatch. It holds the physical state of the
//! door channel and every type that crosses a crate or wire boundary, with zero
//! I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Doorwatch Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              Observing clients (doorwatch-client)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ push (WebSocket) / poll (HTTP)         │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 doorwatch-sync (BroadcastHub)                   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │       doorwatch-engine (EventLog, EscalationTimer, monitor)     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ doorwatch-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌────────────┐  ┌──────────────┐  ┌───────────────────────┐  │   │
//! │  │   │   types    │  │    state     │  │        error          │  │   │
//! │  │   │ Event      │  │ StateStore   │  │ CoreError             │  │   │
//! │  │   │ Statistics │  │ Transition   │  │                       │  │   │
//! │  │   │ Broadcast  │  │ Applied      │  │                       │  │   │
//! │  │   └────────────┘  └──────────────┘  └───────────────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO TIMERS                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Events, statuses, statistics and the broadcast payload
//! - [`state`] - The StateStore: serialized, state-gated transitions
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use doorwatch_core::{StateStore, Transition};
//!
//! let store = StateStore::new();
//!
//! let first = store.apply(Transition::SensorOpened);
//! assert!(first.accepted);
//!
//! // A bounced second edge is a no-op and gets rejected.
//! let bounce = store.apply(Transition::SensorOpened);
//! assert!(!bounce.accepted);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod state;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::CoreError;
pub use state::{Applied, EpisodeId, StateSnapshot, StateStore, SystemState, Transition};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Logical name of the push channel.
pub const EVENTS_CHANNEL: &str = "events";

/// Escalation duration used when no setting is stored (seconds).
pub const DEFAULT_ESCALATION_SECS: u64 = 30;
