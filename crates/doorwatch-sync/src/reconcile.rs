//! # Client-side Reconciliation
//!
//! Decides, for every event that reaches an observer (push or catch-up),
//! whether it is new. Pure and clock-free: the time window compares the
//! events' own server timestamps, so replaying a batch gives the same answer.
//!
//! ## Dedup Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  accept(event)                                                          │
//! │     │                                                                   │
//! │     ├── id in recently-seen set          → DuplicateId    (dropped)     │
//! │     ├── id ≤ high-water mark             → Stale          (dropped)     │
//! │     ├── same (type, description) within  → DuplicateWindow(dropped,     │
//! │     │   window of the last applied one                    HWM advances) │
//! │     └── otherwise                        → Applied        (HWM = id)    │
//! │                                                                         │
//! │  Recently-seen set is capped; when full the oldest half is evicted.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use doorwatch_core::{
    AlarmStatus, DoorStatus, Event, EventBroadcast, EventType, StatisticsSnapshot, StatusView,
};

/// What happened to one incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Applied,
    DuplicateId,
    Stale,
    DuplicateWindow,
}

impl Verdict {
    pub fn is_applied(&self) -> bool {
        matches!(self, Verdict::Applied)
    }
}

/// Local dedup state of one observer.
#[derive(Debug)]
pub struct Reconciler {
    high_water: i64,
    capacity: usize,
    recent_order: VecDeque<i64>,
    recent: HashSet<i64>,
    window: chrono::Duration,
    last_seen: HashMap<(EventType, String), DateTime<Utc>>,
    dropped: u64,
}

impl Reconciler {
    pub fn new(recent_capacity: usize, dedup_window: Duration) -> Self {
        Reconciler {
            high_water: 0,
            capacity: recent_capacity.max(2),
            recent_order: VecDeque::new(),
            recent: HashSet::new(),
            window: chrono::Duration::from_std(dedup_window).unwrap_or(chrono::Duration::zero()),
            last_seen: HashMap::new(),
            dropped: 0,
        }
    }

    /// Starts from a known high-water mark instead of 0.
    pub fn with_high_water_mark(mut self, id: i64) -> Self {
        self.high_water = id.max(0);
        self
    }

    pub fn high_water_mark(&self) -> i64 {
        self.high_water
    }

    /// Number of events dropped as duplicates so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn accept(&mut self, event: &Event) -> Verdict {
        let verdict = self.classify(event);
        match verdict {
            Verdict::Applied => {
                self.high_water = event.id;
                self.remember_id(event.id);
                self.last_seen.insert(event.dedup_key(), event.timestamp);
            }
            Verdict::DuplicateWindow => {
                self.high_water = event.id;
                self.remember_id(event.id);
                self.dropped += 1;
            }
            Verdict::DuplicateId | Verdict::Stale => self.dropped += 1,
        }
        verdict
    }

    fn classify(&mut self, event: &Event) -> Verdict {
        if self.recent.contains(&event.id) {
            return Verdict::DuplicateId;
        }
        if event.id <= self.high_water {
            return Verdict::Stale;
        }

        let window = self.window;
        let now = event.timestamp;
        self.last_seen.retain(|_, at| now - *at < window);

        match self.last_seen.get(&event.dedup_key()) {
            Some(at) if now - *at < window => Verdict::DuplicateWindow,
            _ => Verdict::Applied,
        }
    }

    fn remember_id(&mut self, id: i64) {
        if self.recent.len() >= self.capacity {
            let evict = self.capacity / 2;
            for old in self.recent_order.drain(..evict) {
                self.recent.remove(&old);
            }
        }
        self.recent_order.push_back(id);
        self.recent.insert(id);
    }
}

// =============================================================================
// Observed State
// =============================================================================

/// What an observer currently believes about the door. Updated from push
/// payloads directly, and from applied events while polling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedState {
    pub door_status: DoorStatus,
    pub alarm_status: AlarmStatus,
    pub statistics: StatisticsSnapshot,
    pub timer_set: Option<f64>,
    pub last_event: Option<Event>,
}

impl ObservedState {
    /// Takes everything the broadcast carries.
    pub fn absorb_broadcast(&mut self, payload: &EventBroadcast) {
        self.door_status = payload.door_status;
        self.alarm_status = payload.alarm_status;
        self.statistics = payload.statistics;
        if payload.timer_set.is_some() {
            self.timer_set = payload.timer_set;
        }
        self.last_event = Some(payload.event.clone());
    }

    /// Seeds from the status read.
    pub fn absorb_status(&mut self, status: &StatusView) {
        self.door_status = status.door_status;
        self.alarm_status = status.alarm_status;
        self.timer_set = Some(status.timer_set);
        if status.last_event.is_some() {
            self.last_event = status.last_event.clone();
        }
    }

    /// Infers status from a bare event (catch-up has no state attached).
    pub fn absorb_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::SensorOpen => {
                self.door_status = DoorStatus::Open;
                self.alarm_status = AlarmStatus::Inactive;
            }
            EventType::SensorClose => {
                self.door_status = DoorStatus::Closed;
                self.alarm_status = AlarmStatus::Inactive;
            }
            EventType::AlarmTriggered => {
                self.door_status = DoorStatus::Open;
                self.alarm_status = AlarmStatus::Active;
            }
            _ => {}
        }
        self.last_event = Some(event.clone());
    }
}
