//! # Alarm Monitor
//!
//! The single task that owns the write path: every transition, whatever its
//! source, goes through one apply → append → broadcast sequence here, so event
//! IDs follow transition order and no two transitions interleave.
//!
//! ## Actor Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          AlarmMonitor                                   │
//! │                                                                         │
//! │   MonitorHandle (cloneable)              EscalationTimer (per episode)  │
//! │     submit / acknowledge /                     │                        │
//! │     record / set_escalation_duration           │ ExpiryRequest          │
//! │        │ MonitorCommand                        │                        │
//! │        ▼                                       ▼                        │
//! │   ┌─────────────────────────── select! ──────────────────────────────┐  │
//! │   │  process(transition)                                             │  │
//! │   │    1. StateStore.apply         rejected → Rejected, no effects   │  │
//! │   │    2. timer / indicators       spawn, cancel, clear              │  │
//! │   │    3. EventLog.append          error → Persistence, no publish   │  │
//! │   │    4. EventBroadcaster.publish                                   │  │
//! │   └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │   Reads (status, catch-up, statistics) bypass the actor: they go        │
//! │   straight to the StateStore and the CatchUpReader.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use doorwatch_core::{
    Applied, Event, EventBroadcast, EventType, StateSnapshot, StateStore, StatisticsSnapshot,
    StatusView, Transition,
};
use doorwatch_db::{Database, SettingsRepository};

use crate::error::{EngineError, EngineResult};
use crate::escalation::{EscalationHandle, EscalationTimer, ExpiryRequest};
use crate::event_log::{AppendOutcome, CatchUpReader, EventLog, EventLogConfig};
use crate::indicator::{IndicatorPanel, Led, LogPanel};
use crate::notify::{AlarmNotice, AlarmNotifier, LogNotifier};

// =============================================================================
// Broadcaster Seam
// =============================================================================

/// Receives every persisted event. Must not block: it runs on the monitor task.
pub trait EventBroadcaster: Send + Sync {
    fn publish(&self, payload: &EventBroadcast);
}

/// Broadcaster that drops everything.
pub struct NoOpBroadcaster;

impl EventBroadcaster for NoOpBroadcaster {
    fn publish(&self, _payload: &EventBroadcast) {}
}

// =============================================================================
// Configuration
// =============================================================================

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Used when the settings table has no usable duration.
    pub default_escalation: Duration,

    /// Half of one countdown blink cycle.
    pub blink_half_period: Duration,

    /// EventLog gates and catch-up window.
    pub event_log: EventLogConfig,

    /// Depth of the command queue.
    pub command_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            default_escalation: Duration::from_secs(doorwatch_core::DEFAULT_ESCALATION_SECS),
            blink_half_period: Duration::from_millis(500),
            event_log: EventLogConfig::default(),
            command_capacity: 64,
        }
    }
}

// =============================================================================
// Outcomes and Commands
// =============================================================================

/// Result of submitting a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// No-op given current state; nothing happened.
    Rejected(Applied),
    /// State changed; `logged` says whether an event was recorded.
    Accepted {
        applied: Applied,
        logged: AppendOutcome,
    },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }

    pub fn event(&self) -> Option<&Event> {
        match self {
            SubmitOutcome::Accepted { logged, .. } => logged.event(),
            SubmitOutcome::Rejected(_) => None,
        }
    }
}

type Reply<T> = oneshot::Sender<EngineResult<T>>;

enum MonitorCommand {
    Submit {
        transition: Transition,
        reply: Reply<SubmitOutcome>,
    },
    Acknowledge {
        reply: Reply<SubmitOutcome>,
    },
    Record {
        event_type: EventType,
        description: String,
        reply: Reply<AppendOutcome>,
    },
    SetDuration {
        secs: f64,
        reply: Reply<AppendOutcome>,
    },
    Shutdown,
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable front door to the monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCommand>,
    store: Arc<StateStore>,
    reader: CatchUpReader,
    settings: SettingsRepository,
    default_escalation: Duration,
}

impl MonitorHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> MonitorCommand) -> EngineResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        reply_rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    /// Feeds one transition through the pipeline.
    pub async fn submit(&self, transition: Transition) -> EngineResult<SubmitOutcome> {
        self.request(|reply| MonitorCommand::Submit { transition, reply })
            .await
    }

    /// Acknowledges the current episode, cancelling its escalation.
    pub async fn acknowledge(&self) -> EngineResult<SubmitOutcome> {
        self.request(|reply| MonitorCommand::Acknowledge { reply }).await
    }

    /// Appends a free-form event. State-edge types are always suppressed here.
    pub async fn record(
        &self,
        event_type: EventType,
        description: impl Into<String>,
    ) -> EngineResult<AppendOutcome> {
        let description = description.into();
        self.request(|reply| MonitorCommand::Record {
            event_type,
            description,
            reply,
        })
        .await
    }

    /// Stores a new escalation duration (applies from the next episode) and
    /// logs a `setting_changed` event.
    pub async fn set_escalation_duration(&self, secs: f64) -> EngineResult<AppendOutcome> {
        self.request(|reply| MonitorCommand::SetDuration { secs, reply })
            .await
    }

    /// Current state, taken from the StateStore.
    pub fn snapshot(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    /// Escalation duration the next episode will use, in seconds.
    pub async fn escalation_secs(&self) -> f64 {
        load_escalation_secs(&self.settings, self.default_escalation).await
    }

    pub async fn status(&self) -> EngineResult<StatusView> {
        let state = self.store.snapshot().state;
        Ok(StatusView {
            door_status: state.door_status(),
            alarm_status: state.alarm_status(),
            timer_active: state.timer_active,
            timer_set: self.escalation_secs().await,
            last_event: self.reader.latest().await?,
        })
    }

    pub async fn events_since(&self, since_id: i64, limit: u32) -> EngineResult<Vec<Event>> {
        self.reader.query(since_id, limit).await
    }

    pub async fn statistics(&self) -> EngineResult<StatisticsSnapshot> {
        self.reader.statistics().await
    }

    pub async fn last_event_id(&self) -> EngineResult<i64> {
        self.reader.last_event_id().await
    }

    /// Stops the monitor; pending commands are dropped.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(MonitorCommand::Shutdown).await;
    }
}

/// Escalation duration in seconds from settings, or `fallback`.
async fn load_escalation_secs(settings: &SettingsRepository, fallback: Duration) -> f64 {
    match settings.escalation_duration().await {
        Ok(Some(secs)) if Duration::try_from_secs_f64(secs).is_ok() => secs,
        Ok(_) => fallback.as_secs_f64(),
        Err(e) => {
            warn!(error = %e, "Escalation duration unreadable, using default");
            fallback.as_secs_f64()
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`AlarmMonitor`].
pub struct AlarmMonitorBuilder {
    db: Database,
    config: MonitorConfig,
    store: Option<Arc<StateStore>>,
    panel: Option<Arc<dyn IndicatorPanel>>,
    notifier: Option<Arc<dyn AlarmNotifier>>,
    broadcaster: Option<Arc<dyn EventBroadcaster>>,
}

impl AlarmMonitorBuilder {
    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_panel(mut self, panel: Arc<dyn IndicatorPanel>) -> Self {
        self.panel = Some(panel);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlarmNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn EventBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Spawns the monitor task and returns its handle and join handle.
    pub fn spawn(self) -> (MonitorHandle, JoinHandle<()>) {
        let store = self.store.unwrap_or_default();
        let panel = self.panel.unwrap_or_else(|| Arc::new(LogPanel));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| Arc::new(NoOpBroadcaster));

        let log = EventLog::new(self.db.events(), self.config.event_log.clone());
        let settings = self.db.settings();
        let (commands_tx, commands_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let (expiry_tx, expiry_rx) = mpsc::channel(4);

        let handle = MonitorHandle {
            commands: commands_tx,
            store: store.clone(),
            reader: log.reader(),
            settings: settings.clone(),
            default_escalation: self.config.default_escalation,
        };

        let monitor = AlarmMonitor {
            timer_set: self.config.default_escalation.as_secs_f64(),
            config: self.config,
            store,
            log,
            settings,
            panel,
            notifier,
            broadcaster,
            timer: None,
            commands_rx,
            expiry_tx,
            expiry_rx,
        };
        let task = tokio::spawn(monitor.run());

        (handle, task)
    }
}

// =============================================================================
// Actor
// =============================================================================

/// The monitor task. Construct through [`AlarmMonitor::builder`].
pub struct AlarmMonitor {
    config: MonitorConfig,
    store: Arc<StateStore>,
    log: EventLog,
    settings: SettingsRepository,
    panel: Arc<dyn IndicatorPanel>,
    notifier: Arc<dyn AlarmNotifier>,
    broadcaster: Arc<dyn EventBroadcaster>,
    timer: Option<EscalationHandle>,
    /// Duration of the current (or most recent) episode, in seconds.
    timer_set: f64,
    commands_rx: mpsc::Receiver<MonitorCommand>,
    expiry_tx: mpsc::Sender<ExpiryRequest>,
    expiry_rx: mpsc::Receiver<ExpiryRequest>,
}

impl AlarmMonitor {
    pub fn builder(db: Database, config: MonitorConfig) -> AlarmMonitorBuilder {
        AlarmMonitorBuilder {
            db,
            config,
            store: None,
            panel: None,
            notifier: None,
            broadcaster: None,
        }
    }

    async fn run(mut self) {
        info!("Alarm monitor started");
        self.panel.set(Led::Ready, true);

        loop {
            tokio::select! {
                Some(request) = self.expiry_rx.recv() => {
                    let accepted = match self.process(Transition::AlarmFired { episode: request.episode }).await {
                        Ok(outcome) => outcome.is_accepted(),
                        // The alarm is latched in state even when its event failed to persist.
                        Err(_) => self.store.snapshot().state.alarm_active,
                    };
                    let _ = request.reply.send(accepted);
                }
                command = self.commands_rx.recv() => {
                    match command {
                        Some(MonitorCommand::Submit { transition, reply }) => {
                            let _ = reply.send(self.process(transition).await);
                        }
                        Some(MonitorCommand::Acknowledge { reply }) => {
                            let episode = self.store.snapshot().episode;
                            let _ = reply.send(self.process(Transition::EscalationCancelled { episode }).await);
                        }
                        Some(MonitorCommand::Record { event_type, description, reply }) => {
                            let _ = reply.send(self.record(event_type, &description).await);
                        }
                        Some(MonitorCommand::SetDuration { secs, reply }) => {
                            let _ = reply.send(self.set_duration(secs).await);
                        }
                        Some(MonitorCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        for led in Led::ALL {
            self.panel.set(led, false);
        }
        info!(suppressed = self.log.suppressed_count(), "Alarm monitor stopped");
    }

    /// apply → side effects → append → broadcast.
    async fn process(&mut self, transition: Transition) -> EngineResult<SubmitOutcome> {
        let applied = self.store.apply(transition);
        if !applied.accepted {
            debug!(?transition, episode = applied.snapshot.episode, "Transition rejected");
            return Ok(SubmitOutcome::Rejected(applied));
        }

        let episode = applied.snapshot.episode;
        let description = match transition {
            Transition::SensorOpened => {
                self.timer_set =
                    load_escalation_secs(&self.settings, self.config.default_escalation).await;
                self.panel.set(Led::Alarm, false);
                self.start_timer(episode);
                info!(episode, duration_secs = self.timer_set, "Door opened, escalation timer started");
                "Door opened".to_string()
            }
            Transition::SensorClosed => {
                self.stop_timer();
                self.panel.clear_escalation();
                info!(episode, "Door closed");
                "Door closed".to_string()
            }
            Transition::AlarmFired { .. } => {
                self.timer = None;
                self.panel.set(Led::Countdown, false);
                self.panel.set(Led::Alarm, true);
                warn!(episode, duration_secs = self.timer_set, "Door left open, alarm triggered");
                format!("Alarm triggered after {} seconds", self.timer_set)
            }
            Transition::EscalationCancelled { .. } => {
                self.stop_timer();
                self.panel.set(Led::Countdown, false);
                info!(episode, "Escalation acknowledged");
                "Escalation acknowledged".to_string()
            }
        };

        let logged = match self
            .log
            .append(transition.event_type(), &description, Some(&applied))
            .await
        {
            Ok(logged) => logged,
            Err(e) => {
                error!(error = %e, ?transition, "Failed to persist event; not broadcasting");
                if matches!(transition, Transition::AlarmFired { .. }) {
                    self.notify_alarm(episode, None);
                }
                return Err(e);
            }
        };

        if matches!(transition, Transition::AlarmFired { .. }) {
            self.notify_alarm(episode, logged.event().map(|e| e.id));
        }
        self.publish(&logged, applied.snapshot);

        Ok(SubmitOutcome::Accepted { applied, logged })
    }

    async fn record(&mut self, event_type: EventType, description: &str) -> EngineResult<AppendOutcome> {
        let logged = self.log.append(event_type, description, None).await.map_err(|e| {
            error!(error = %e, "Failed to persist event; not broadcasting");
            e
        })?;
        self.publish(&logged, self.store.snapshot());
        Ok(logged)
    }

    async fn set_duration(&mut self, secs: f64) -> EngineResult<AppendOutcome> {
        if !secs.is_finite() || secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
            return Err(EngineError::InvalidDuration(secs.to_string()));
        }
        self.settings.set_escalation_duration(secs).await?;
        self.record(
            EventType::SettingChanged,
            &format!("Timer duration changed to {secs} seconds"),
        )
        .await
    }

    fn start_timer(&mut self, episode: u64) {
        self.stop_timer();
        let duration = Duration::try_from_secs_f64(self.timer_set)
            .unwrap_or(self.config.default_escalation);
        self.timer = Some(EscalationTimer::spawn(
            episode,
            duration,
            self.config.blink_half_period,
            self.store.clone(),
            self.panel.clone(),
            self.expiry_tx.clone(),
        ));
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    fn notify_alarm(&self, episode: u64, event_id: Option<i64>) {
        self.notifier.notify(&AlarmNotice {
            episode,
            duration_secs: self.timer_set,
            triggered_at: Utc::now(),
            event_id,
        });
    }

    fn publish(&self, logged: &AppendOutcome, snapshot: StateSnapshot) {
        if let AppendOutcome::Recorded { event, statistics } = logged {
            let payload = EventBroadcast {
                event: event.clone(),
                door_status: snapshot.state.door_status(),
                alarm_status: snapshot.state.alarm_status(),
                statistics: *statistics,
                timer_set: Some(self.timer_set),
            };
            debug!(event_id = event.id, event_type = %event.event_type, "Publishing event");
            self.broadcaster.publish(&payload);
        }
    }
}
