//! # Push Channel Messages
//!
//! Messages exchanged on the `events` push channel.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Push Channel Messages                               │
//! │                                                                         │
//! │  ON CONNECT                                                            │
//! │  ──────────                                                            │
//! │  hub    ───► connection_status { status, server_time, last_event_id }  │
//! │                                                                         │
//! │  LIVE EVENTS                                                           │
//! │  ───────────                                                           │
//! │  hub    ───► new_event { event, door_status, alarm_status,             │
//! │                          statistics, timer_set }                       │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  client ───► ping { timestamp }                                        │
//! │  hub    ───► pong { timestamp }                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON, one message per text frame:
//! ```json
//! { "type": "new_event", "payload": { "event": { "id": 7, ... }, ... } }
//! ```

use serde::{Deserialize, Serialize};

use doorwatch_core::EventBroadcast;

// =============================================================================
// Server → Client
// =============================================================================

/// Messages the hub sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A persisted event plus the state and statistics at its append.
    NewEvent(EventBroadcast),

    /// Greeting sent once per connection.
    ConnectionStatus(ConnectionStatus),

    /// Reply to a client `ping`.
    Pong { timestamp: String },
}

/// Payload of the connection greeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: String,
    /// RFC 3339, UTC.
    pub server_time: String,
    /// Highest persisted event ID at connect time (0 when the log is empty).
    pub last_event_id: i64,
}

impl ServerMessage {
    /// Returns the message type name (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::NewEvent(_) => "new_event",
            ServerMessage::ConnectionStatus(_) => "connection_status",
            ServerMessage::Pong { .. } => "pong",
        }
    }

    pub fn connected(last_event_id: i64) -> Self {
        ServerMessage::ConnectionStatus(ConnectionStatus {
            status: "connected".to_string(),
            server_time: chrono::Utc::now().to_rfc3339(),
            last_event_id,
        })
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// Client → Server
// =============================================================================

/// Messages an observer may send. Anything else is ignored by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping { timestamp: String },
}

impl ClientMessage {
    pub fn ping() -> Self {
        ClientMessage::Ping {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
