//! # Alarm Notification
//!
//! Hook invoked once per escalation, after the alarm transition is accepted.
//! Implementations must not block: they run on the monitor task.

use chrono::{DateTime, Utc};
use tracing::warn;

use doorwatch_core::EpisodeId;

/// What an escalation looks like to a notifier.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmNotice {
    pub episode: EpisodeId,
    /// Escalation duration that elapsed, in seconds.
    pub duration_secs: f64,
    pub triggered_at: DateTime<Utc>,
    /// ID of the persisted `alarm_triggered` event, when one was recorded.
    pub event_id: Option<i64>,
}

/// Receives escalation notices.
pub trait AlarmNotifier: Send + Sync {
    fn notify(&self, notice: &AlarmNotice);
}

/// Notifier that raises a structured alert in the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl AlarmNotifier for LogNotifier {
    fn notify(&self, notice: &AlarmNotice) {
        warn!(
            episode = notice.episode,
            duration_secs = notice.duration_secs,
            triggered_at = %notice.triggered_at.to_rfc3339(),
            event_id = ?notice.event_id,
            "ALARM: door left open past escalation duration"
        );
    }
}
