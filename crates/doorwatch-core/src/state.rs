//! # StateStore
//!
//! The single owned instance of the door channel's physical state.
//!
//! ## Transition Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Transition              Rejected when                 Effect           │
//! │  ──────────────────────  ────────────────────────────  ───────────────  │
//! │  SensorOpened            sensor_open                   open, timer on,  │
//! │                                                        alarm off, new   │
//! │                                                        episode          │
//! │  SensorClosed            !sensor_open                  all flags off    │
//! │  AlarmFired{ep}          alarm_active, !sensor_open,   timer off,       │
//! │                          !timer_active, stale ep       alarm on         │
//! │  EscalationCancelled{ep} !timer_active, stale ep       timer off        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `apply` runs "read, decide, mutate" inside one critical section, so
//! no caller ever observes a half-applied transition. A rejection is not an
//! error: it is the state-based defense against bouncing sensor edges and
//! late timer expiries.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::types::{AlarmStatus, DoorStatus, EventType};

/// Monotonic counter identifying one open episode.
pub type EpisodeId = u64;

// =============================================================================
// State
// =============================================================================

/// The three flags defining physical state.
///
/// Invariants maintained by [`StateStore`]:
/// - `timer_active ⇒ sensor_open`
/// - `timer_active` and `alarm_active` are never both true
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub sensor_open: bool,
    pub timer_active: bool,
    pub alarm_active: bool,
}

impl SystemState {
    pub fn door_status(&self) -> DoorStatus {
        DoorStatus::from_open(self.sensor_open)
    }

    pub fn alarm_status(&self) -> AlarmStatus {
        AlarmStatus::from_active(self.alarm_active)
    }
}

/// State plus the episode it belongs to, copied out of the lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: SystemState,
    /// Current (or most recent) open episode; 0 before the first open.
    pub episode: EpisodeId,
}

// =============================================================================
// Transitions
// =============================================================================

/// A requested change to [`SystemState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    SensorOpened,
    SensorClosed,
    /// Escalation expiry for the given episode.
    AlarmFired { episode: EpisodeId },
    /// Escalation acknowledged before expiry.
    EscalationCancelled { episode: EpisodeId },
}

impl Transition {
    /// The event type logged when this transition is accepted.
    pub fn event_type(&self) -> EventType {
        match self {
            Transition::SensorOpened => EventType::SensorOpen,
            Transition::SensorClosed => EventType::SensorClose,
            Transition::AlarmFired { .. } => EventType::AlarmTriggered,
            Transition::EscalationCancelled { .. } => EventType::EscalationCancelled,
        }
    }
}

/// Outcome of [`StateStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub transition: Transition,
    /// State after the transition (unchanged when rejected).
    pub snapshot: StateSnapshot,
    pub accepted: bool,
}

impl Applied {
    /// True if this outcome backs an event of the given type.
    pub fn backs(&self, event_type: &EventType) -> bool {
        self.accepted && self.transition.event_type() == *event_type
    }
}

// =============================================================================
// Store
// =============================================================================

/// Serialized owner of [`SystemState`].
#[derive(Debug, Default)]
pub struct StateStore {
    inner: Mutex<StateSnapshot>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StateSnapshot> {
        // The critical section never panics midway, so a poisoned guard still
        // holds a consistent state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies a transition atomically.
    pub fn apply(&self, transition: Transition) -> Applied {
        let mut current = self.lock();
        let s = current.state;

        let accepted = match transition {
            Transition::SensorOpened => !s.sensor_open,
            Transition::SensorClosed => s.sensor_open,
            Transition::AlarmFired { episode } => {
                !s.alarm_active && s.sensor_open && s.timer_active && episode == current.episode
            }
            Transition::EscalationCancelled { episode } => {
                s.timer_active && episode == current.episode
            }
        };

        if accepted {
            match transition {
                Transition::SensorOpened => {
                    current.episode += 1;
                    current.state = SystemState {
                        sensor_open: true,
                        timer_active: true,
                        alarm_active: false,
                    };
                }
                Transition::SensorClosed => {
                    current.state = SystemState::default();
                }
                Transition::AlarmFired { .. } => {
                    current.state.timer_active = false;
                    current.state.alarm_active = true;
                }
                Transition::EscalationCancelled { .. } => {
                    current.state.timer_active = false;
                }
            }
        }

        Applied {
            transition,
            snapshot: *current,
            accepted,
        }
    }

    /// Copies the current state out of the lock.
    pub fn snapshot(&self) -> StateSnapshot {
        *self.lock()
    }

    /// True while the escalation timer of `episode` is allowed to keep running.
    pub fn timer_running(&self, episode: EpisodeId) -> bool {
        let current = self.lock();
        current.episode == episode && current.state.timer_active
    }
}
