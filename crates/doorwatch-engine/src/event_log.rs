//! # EventLog
//!
//! Dedup-gated append plus the bounded catch-up read.
//!
//! ## Append Gates
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  append(event_type, description, backing)                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  STATE GATE   state-edge type without a matching accepted transition    │
//! │       │       → Suppressed(NotBacked)                                   │
//! │       ▼                                                                 │
//! │  TIME GATE    same (type, description) appended < dedup_window ago      │
//! │       │       → Suppressed(WithinWindow)                                │
//! │       ▼                                                                 │
//! │  PERSIST      insert + statistics in one transaction                    │
//! │       │       → Recorded { event, statistics }                          │
//! │       ▼       (storage failure → EngineError::Persistence)              │
//! │  remember (type, description) at now                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Catch-up Window
//! Every event is kept in storage, but only the newest `catch_up_max_events`
//! (optionally also only those younger than `catch_up_max_age`) are served:
//! `id > max(since, max_id - catch_up_max_events)`, ascending, at most
//! `min(limit, max_page_size)`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::debug;

use doorwatch_core::{Applied, Event, EventType, StatisticsSnapshot};
use doorwatch_db::EventRepository;

use crate::error::EngineResult;

// =============================================================================
// Configuration
// =============================================================================

/// EventLog tuning.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Repeat window for the time gate.
    pub dedup_window: Duration,

    /// Newest N events served to catch-up.
    pub catch_up_max_events: i64,

    /// Optional age bound on catch-up.
    pub catch_up_max_age: Option<Duration>,

    /// Upper bound on one catch-up page.
    pub max_page_size: u32,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        EventLogConfig {
            dedup_window: Duration::from_millis(100),
            catch_up_max_events: 500,
            catch_up_max_age: None,
            max_page_size: 200,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Why an append was not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// State-edge event without an accepted transition behind it.
    NotBacked,
    /// Same (type, description) inside the dedup window.
    WithinWindow,
}

/// Result of [`EventLog::append`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Recorded {
        event: Event,
        statistics: StatisticsSnapshot,
    },
    Suppressed(SuppressReason),
}

impl AppendOutcome {
    pub fn event(&self) -> Option<&Event> {
        match self {
            AppendOutcome::Recorded { event, .. } => Some(event),
            AppendOutcome::Suppressed(_) => None,
        }
    }

    pub fn is_recorded(&self) -> bool {
        matches!(self, AppendOutcome::Recorded { .. })
    }
}

// =============================================================================
// EventLog
// =============================================================================

/// The single writer of the event log. Owned by the monitor task.
pub struct EventLog {
    events: EventRepository,
    config: EventLogConfig,
    recent: HashMap<(EventType, String), Instant>,
    suppressed: u64,
}

impl EventLog {
    pub fn new(events: EventRepository, config: EventLogConfig) -> Self {
        EventLog {
            events,
            config,
            recent: HashMap::new(),
            suppressed: 0,
        }
    }

    /// Appends an event if both gates let it through.
    ///
    /// `backing` is the outcome of the transition this event reports, if any.
    pub async fn append(
        &mut self,
        event_type: EventType,
        description: &str,
        backing: Option<&Applied>,
    ) -> EngineResult<AppendOutcome> {
        if event_type.is_state_edge() && !backing.is_some_and(|a| a.backs(&event_type)) {
            return Ok(self.suppress(&event_type, SuppressReason::NotBacked));
        }

        let now = Instant::now();
        let window = self.config.dedup_window;
        self.recent.retain(|_, at| now.duration_since(*at) < window);

        let key = (event_type, description.to_string());
        if self.recent.contains_key(&key) {
            return Ok(self.suppress(&key.0, SuppressReason::WithinWindow));
        }

        let (event, statistics) = self
            .events
            .insert_with_statistics(&key.0, description, Utc::now())
            .await?;

        self.recent.insert(key, now);
        Ok(AppendOutcome::Recorded { event, statistics })
    }

    fn suppress(&mut self, event_type: &EventType, reason: SuppressReason) -> AppendOutcome {
        self.suppressed += 1;
        debug!(%event_type, ?reason, total_suppressed = self.suppressed, "Event suppressed");
        AppendOutcome::Suppressed(reason)
    }

    /// Number of appends suppressed so far, for diagnostics.
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed
    }

    /// A cloneable read side sharing this log's catch-up window.
    pub fn reader(&self) -> CatchUpReader {
        CatchUpReader {
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

// =============================================================================
// Catch-up Reader
// =============================================================================

/// Read-only access to the log for catch-up and statistics.
#[derive(Debug, Clone)]
pub struct CatchUpReader {
    events: EventRepository,
    config: EventLogConfig,
}

impl CatchUpReader {
    /// Events with `id > since_id` inside the catch-up window, ascending.
    /// An empty result means "no news".
    pub async fn query(&self, since_id: i64, limit: u32) -> EngineResult<Vec<Event>> {
        let limit = limit.min(self.config.max_page_size);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let max_id = self.events.max_id().await?;
        let floor = since_id
            .max(max_id.saturating_sub(self.config.catch_up_max_events))
            .max(0);
        let min_occurred_ms = self
            .config
            .catch_up_max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| (Utc::now() - age).timestamp_millis());

        Ok(self.events.since(floor, min_occurred_ms, limit).await?)
    }

    pub async fn statistics(&self) -> EngineResult<StatisticsSnapshot> {
        Ok(self.events.statistics().await?)
    }

    pub async fn latest(&self) -> EngineResult<Option<Event>> {
        Ok(self.events.latest().await?)
    }

    pub async fn last_event_id(&self) -> EngineResult<i64> {
        Ok(self.events.max_id().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doorwatch_core::{StateStore, Transition};
    use doorwatch_db::{Database, DbConfig};

    async fn log_with(config: EventLogConfig) -> EventLog {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        EventLog::new(db.events(), config)
    }

    #[tokio::test]
    async fn test_unbacked_state_edge_suppressed() {
        let mut log = log_with(EventLogConfig::default()).await;

        let outcome = log.append(EventType::SensorOpen, "Door opened", None).await.unwrap();
        assert_eq!(outcome, AppendOutcome::Suppressed(SuppressReason::NotBacked));

        let store = StateStore::new();
        store.apply(Transition::SensorOpened);
        let rejected = store.apply(Transition::SensorOpened);
        let outcome = log
            .append(EventType::SensorOpen, "Door opened", Some(&rejected))
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Suppressed(SuppressReason::NotBacked));
        assert_eq!(log.suppressed_count(), 2);
    }

    #[tokio::test]
    async fn test_mismatched_backing_suppressed() {
        let mut log = log_with(EventLogConfig::default()).await;
        let store = StateStore::new();
        let opened = store.apply(Transition::SensorOpened);

        let outcome = log
            .append(EventType::SensorClose, "Door closed", Some(&opened))
            .await
            .unwrap();
        assert!(!outcome.is_recorded());
    }

    #[tokio::test]
    async fn test_duplicate_within_window_suppressed() {
        let mut log = log_with(EventLogConfig {
            dedup_window: Duration::from_secs(60),
            ..EventLogConfig::default()
        })
        .await;

        let first = log
            .append(EventType::SettingChanged, "Timer duration changed to 10 seconds", None)
            .await
            .unwrap();
        assert!(first.is_recorded());

        let bounce = log
            .append(EventType::SettingChanged, "Timer duration changed to 10 seconds", None)
            .await
            .unwrap();
        assert_eq!(bounce, AppendOutcome::Suppressed(SuppressReason::WithinWindow));

        let other = log
            .append(EventType::SettingChanged, "Timer duration changed to 20 seconds", None)
            .await
            .unwrap();
        assert!(other.is_recorded());
    }

    #[tokio::test]
    async fn test_repeat_after_window_recorded() {
        let mut log = log_with(EventLogConfig {
            dedup_window: Duration::from_millis(30),
            ..EventLogConfig::default()
        })
        .await;

        log.append(EventType::Other("note".into()), "same", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let later = log
            .append(EventType::Other("note".into()), "same", None)
            .await
            .unwrap();
        assert!(later.is_recorded());
    }

    #[tokio::test]
    async fn test_statistics_include_appended_event() {
        let mut log = log_with(EventLogConfig::default()).await;
        let store = StateStore::new();

        let opened = store.apply(Transition::SensorOpened);
        log.append(EventType::SensorOpen, "Door opened", Some(&opened))
            .await
            .unwrap();
        let closed = store.apply(Transition::SensorClosed);
        let outcome = log
            .append(EventType::SensorClose, "Door closed", Some(&closed))
            .await
            .unwrap();

        match outcome {
            AppendOutcome::Recorded { event, statistics } => {
                assert_eq!(statistics.total_events, 2);
                assert_eq!(statistics.door_open_events, 1);
                assert_eq!(statistics.door_close_events, 1);
                assert_eq!(event.id, log.reader().last_event_id().await.unwrap());
            }
            other => panic!("expected a recorded event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_catch_up_window_and_clamp() {
        let mut log = log_with(EventLogConfig {
            catch_up_max_events: 3,
            max_page_size: 2,
            ..EventLogConfig::default()
        })
        .await;
        for i in 0..5 {
            log.append(EventType::Other("note".into()), &format!("note {i}"), None)
                .await
                .unwrap();
        }
        let reader = log.reader();

        // Only the newest three (ids 3..=5) are served, two per page.
        let page = reader.query(0, 100).await.unwrap();
        assert_eq!(page.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4]);

        let next = reader.query(4, 100).await.unwrap();
        assert_eq!(next.iter().map(|e| e.id).collect::<Vec<_>>(), vec![5]);

        assert!(reader.query(5, 100).await.unwrap().is_empty());
        assert!(reader.query(0, 0).await.unwrap().is_empty());
    }
}
