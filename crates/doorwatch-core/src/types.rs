//! # Domain Types
//!
//! Core domain types shared by the engine, the hub and every client.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────────┐   │
//! │  │     Event       │   │   EventType     │   │ StatisticsSnapshot  │   │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────────  │   │
//! │  │  id (monotonic) │   │  sensor_open    │   │  total_events       │   │
//! │  │  event_type     │   │  sensor_close   │   │  door_open_events   │   │
//! │  │  description    │   │  alarm_triggered│   │  door_close_events  │   │
//! │  │  timestamp (UTC)│   │  ... extensible │   │  alarm_events       │   │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │ EventBroadcast  { event, door_status, alarm_status, statistics }│   │
//! │  │ The single immutable payload fanned out for every new event.    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! All types serialize to the JSON shapes consumed by clients. Timestamps are
//! RFC 3339 in UTC; presentation layers convert to their display offset.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// =============================================================================
// Event Type
// =============================================================================

/// Kind of a logged event.
///
/// The first four kinds are *state edges*: they may only be logged when backed
/// by an accepted StateStore transition. Everything else is free-form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Sensor reported open.
    SensorOpen,
    /// Sensor reported closed.
    SensorClose,
    /// Escalation timer expired with the door still open.
    AlarmTriggered,
    /// Escalation acknowledged before expiry.
    EscalationCancelled,
    /// A setting (escalation duration) changed.
    SettingChanged,
    /// Any other event kind, carried verbatim.
    Other(String),
}

impl EventType {
    /// Returns the wire name of this event type.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::SensorOpen => "sensor_open",
            EventType::SensorClose => "sensor_close",
            EventType::AlarmTriggered => "alarm_triggered",
            EventType::EscalationCancelled => "escalation_cancelled",
            EventType::SettingChanged => "setting_changed",
            EventType::Other(name) => name,
        }
    }

    /// Returns true if this type may only be logged for an accepted transition.
    pub fn is_state_edge(&self) -> bool {
        matches!(
            self,
            EventType::SensorOpen
                | EventType::SensorClose
                | EventType::AlarmTriggered
                | EventType::EscalationCancelled
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CoreError::EmptyEventType);
        }
        Ok(match trimmed {
            "sensor_open" => EventType::SensorOpen,
            "sensor_close" => EventType::SensorClose,
            "alarm_triggered" => EventType::AlarmTriggered,
            "escalation_cancelled" => EventType::EscalationCancelled,
            "setting_changed" => EventType::SettingChanged,
            other => EventType::Other(other.to_string()),
        })
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Event
// =============================================================================

/// An immutable, persisted event record.
///
/// Only the event log creates these; the ID is assigned at persistence and is
/// strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic identifier assigned by storage.
    pub id: i64,

    /// Event kind.
    pub event_type: EventType,

    /// Free-text description.
    pub description: String,

    /// When the event was recorded (UTC).
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Key used by time-window deduplication.
    pub fn dedup_key(&self) -> (EventType, String) {
        (self.event_type.clone(), self.description.clone())
    }
}

// =============================================================================
// Status Values
// =============================================================================

/// Door status as shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DoorStatus {
    Open,
    #[default]
    Closed,
}

impl DoorStatus {
    pub fn from_open(open: bool) -> Self {
        if open {
            DoorStatus::Open
        } else {
            DoorStatus::Closed
        }
    }
}

impl fmt::Display for DoorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoorStatus::Open => write!(f, "Open"),
            DoorStatus::Closed => write!(f, "Closed"),
        }
    }
}

/// Alarm status as shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlarmStatus {
    Active,
    #[default]
    Inactive,
}

impl AlarmStatus {
    pub fn from_active(active: bool) -> Self {
        if active {
            AlarmStatus::Active
        } else {
            AlarmStatus::Inactive
        }
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmStatus::Active => write!(f, "Active"),
            AlarmStatus::Inactive => write!(f, "Inactive"),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Event counts taken from the log at one instant.
///
/// Never stored; recomputed whenever it is needed. When attached to a broadcast
/// it always includes the event being broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total_events: i64,
    pub door_open_events: i64,
    pub door_close_events: i64,
    pub alarm_events: i64,
}

// =============================================================================
// Broadcast Payload
// =============================================================================

/// Payload of the `new_event` push message.
///
/// Built once per accepted event and shared read-only by every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBroadcast {
    pub event: Event,
    pub door_status: DoorStatus,
    pub alarm_status: AlarmStatus,
    pub statistics: StatisticsSnapshot,

    /// Escalation duration in seconds at the time of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_set: Option<f64>,
}

/// Response body of the catch-up read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Event>,
}

/// Response body of the status read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub door_status: DoorStatus,
    pub alarm_status: AlarmStatus,
    pub timer_active: bool,
    pub timer_set: f64,
    pub last_event: Option<Event>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EventType::SensorOpen.as_str(), "sensor_open");
        assert_eq!(EventType::SensorClose.as_str(), "sensor_close");
        assert_eq!(EventType::AlarmTriggered.as_str(), "alarm_triggered");
        assert_eq!(
            "setting_changed".parse::<EventType>().unwrap(),
            EventType::SettingChanged
        );
        assert_eq!(
            "maintenance".parse::<EventType>().unwrap(),
            EventType::Other("maintenance".into())
        );
        assert!("  ".parse::<EventType>().is_err());
    }

    #[test]
    fn test_state_edges() {
        assert!(EventType::SensorOpen.is_state_edge());
        assert!(EventType::AlarmTriggered.is_state_edge());
        assert!(!EventType::SettingChanged.is_state_edge());
        assert!(!EventType::Other("x".into()).is_state_edge());
    }

    #[test]
    fn test_broadcast_wire_shape() {
        let payload = EventBroadcast {
            event: Event {
                id: 7,
                event_type: EventType::AlarmTriggered,
                description: "Alarm triggered after 30 seconds".into(),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap(),
            },
            door_status: DoorStatus::Open,
            alarm_status: AlarmStatus::Active,
            statistics: StatisticsSnapshot {
                total_events: 3,
                door_open_events: 1,
                door_close_events: 1,
                alarm_events: 1,
            },
            timer_set: None,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event"]["id"], 7);
        assert_eq!(json["event"]["event_type"], "alarm_triggered");
        assert_eq!(json["event"]["timestamp"], "2024-05-01T12:00:30Z");
        assert_eq!(json["door_status"], "Open");
        assert_eq!(json["alarm_status"], "Active");
        assert_eq!(json["statistics"]["total_events"], 3);
        assert!(json.get("timer_set").is_none());

        let back: EventBroadcast = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
