//! # doorwatch-sync: Hub and Observer Sync for Doorwatch
//!
//! Everything between the monitor and the people watching it: the broadcast
//! hub on the server, and the client sync agent that keeps an observer's view
//! current over push, with polling as a fallback.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Doorwatch Sync Architecture                       │
//! │                                                                         │
//! │  SERVER (doorwatch-daemon)                                              │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ AlarmMonitor ──publish──► Fanout ──► HubServer (Axum)            │  │
//! │  │                                       /ws/events   push          │  │
//! │  │                                       /events      catch-up      │  │
//! │  │                                       /statistics  /status       │  │
//! │  └──────────────────────────────────────────┬───────────────────────┘  │
//! │                                             │                           │
//! │                      WebSocket (push)  and  HTTP (catch-up / poll)      │
//! │                                             │                           │
//! │  OBSERVER (doorwatch-client, one per viewer)▼                           │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ ClientSyncAgent                                                  │  │
//! │  │   Transport      reconnecting WebSocket client                   │  │
//! │  │   CatchUpClient  GET /events?since=HWM, /statistics, /status     │  │
//! │  │   LinkMachine    push / poll / disconnected                      │  │
//! │  │   Reconciler     recently-seen IDs + time window + HWM           │  │
//! │  │   AgentEmitter   presentation adapter                            │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`hub`] - Fanout and the Axum server (push channel plus HTTP reads)
//! - [`protocol`] - Push channel message types
//! - [`agent`] - `ClientSyncAgent` and its handle
//! - [`transport`] - WebSocket client with reconnection
//! - [`catch_up`] - HTTP client for the read endpoints
//! - [`link`] - Pure push/poll/disconnected state machine
//! - [`reconcile`] - Pure client-side dedup
//! - [`config`] - `doorwatch.toml` loading and validation
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use doorwatch_sync::{ClientSettings, ClientSyncAgent};
//!
//! let (agent, _task) = ClientSyncAgent::builder(ClientSettings::for_server("http://door:8765"))
//!     .with_emitter(Arc::new(MyView))
//!     .spawn()?;
//!
//! let status = agent.status().await;
//! println!("mode: {}", status.mode);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod catch_up;
pub mod config;
pub mod error;
pub mod hub;
pub mod link;
pub mod protocol;
pub mod reconcile;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentEmitter, AgentHandle, AgentStatus, ClientSyncAgent, NoOpEmitter};
pub use catch_up::CatchUpClient;
pub use config::{
    ClientSettings, DatabaseSettings, DoorwatchConfig, EscalationSettings, EventLogSettings,
    HubSettings, IndicatorMode, IndicatorSettings, SensorKind, SensorSettings, DEFAULT_HUB_PORT,
    PUSH_PATH,
};
pub use error::{SyncError, SyncResult};
pub use hub::{Fanout, HubHandle, HubServer, Subscriber};
pub use link::{LinkMachine, LinkMode, ModeChange};
pub use protocol::{ClientMessage, ConnectionStatus, ServerMessage};
pub use reconcile::{ObservedState, Reconciler, Verdict};
pub use transport::{ConnectionState, Transport, TransportConfig, TransportEvent, TransportHandle};
