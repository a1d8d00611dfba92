//! # Client Sync Agent
//!
//! Runs once per observing client. Keeps a push subscription, falls back to
//! polling when push is unavailable, and feeds every incoming event through
//! one [`Reconciler`] so delivery is idempotent.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ClientSyncAgent Architecture                       │
//! │                                                                         │
//! │  ┌────────────────┐  TransportEvent   ┌──────────────────────────────┐  │
//! │  │   Transport    │ ────────────────► │         agent loop           │  │
//! │  │  (WebSocket,   │                   │   (one task, no overlap)     │  │
//! │  │   reconnects)  │ ◄── reconnect ─── │                              │  │
//! │  └────────────────┘                   │  LinkMachine   push/poll/    │  │
//! │                                       │                disconnected  │  │
//! │  ┌────────────────┐  pages, stats     │  Reconciler    dedup + HWM   │  │
//! │  │ CatchUpClient  │ ────────────────► │  ObservedState               │  │
//! │  │    (HTTP)      │                   └──────────────┬───────────────┘  │
//! │  └────────────────┘                                  │                  │
//! │                                                      ▼                  │
//! │                                          AgentEmitter (presentation)    │
//! │                                                                         │
//! │  TIMERS (only while polling):                                          │
//! │  poll_interval        GET /events?since=HWM                            │
//! │  statistics_interval  GET /statistics                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use doorwatch_core::Event;

use crate::catch_up::CatchUpClient;
use crate::config::ClientSettings;
use crate::error::{SyncError, SyncResult};
use crate::link::{LinkMachine, LinkMode, ModeChange};
use crate::protocol::ServerMessage;
use crate::reconcile::{ObservedState, Reconciler, Verdict};
use crate::transport::{Transport, TransportConfig, TransportEvent, TransportHandle};

const PUSH_PING_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Agent Status
// =============================================================================

/// Snapshot of an agent for external queries.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub mode: LinkMode,
    pub high_water_mark: i64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub observed: ObservedState,
    /// Events applied since start.
    pub applied: u64,
    /// Events dropped as duplicates since start.
    pub dropped: u64,
}

impl Default for AgentStatus {
    fn default() -> Self {
        AgentStatus {
            mode: LinkMode::Connecting,
            high_water_mark: 0,
            consecutive_failures: 0,
            last_error: None,
            observed: ObservedState::default(),
            applied: 0,
            dropped: 0,
        }
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Presentation side of an agent. Called from the agent task; keep it quick.
pub trait AgentEmitter: Send + Sync {
    /// An event passed reconciliation.
    fn emit_event(&self, event: &Event);

    /// Door, alarm or statistics view changed.
    fn emit_state(&self, state: &ObservedState);

    fn emit_mode(&self, change: ModeChange);

    fn emit_error(&self, message: &str, retryable: bool);
}

/// Emitter that ignores everything.
pub struct NoOpEmitter;

impl AgentEmitter for NoOpEmitter {
    fn emit_event(&self, _event: &Event) {}
    fn emit_state(&self, _state: &ObservedState) {}
    fn emit_mode(&self, _change: ModeChange) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Agent Handle
// =============================================================================

enum AgentCommand {
    Retry,
    Shutdown,
}

/// Control side of a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::Sender<AgentCommand>,
    status: Arc<RwLock<AgentStatus>>,
}

impl AgentHandle {
    pub async fn status(&self) -> AgentStatus {
        self.status.read().await.clone()
    }

    pub async fn mode(&self) -> LinkMode {
        self.status.read().await.mode
    }

    /// Manual refresh: resume polling after giving up and retry push at once.
    pub async fn retry(&self) -> SyncResult<()> {
        self.commands
            .send(AgentCommand::Retry)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(AgentCommand::Shutdown).await;
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Entry point: `ClientSyncAgent::builder(settings).spawn()`.
pub struct ClientSyncAgent;

impl ClientSyncAgent {
    pub fn builder(settings: ClientSettings) -> ClientSyncAgentBuilder {
        ClientSyncAgentBuilder {
            settings,
            emitter: None,
            high_water_mark: 0,
        }
    }
}

pub struct ClientSyncAgentBuilder {
    settings: ClientSettings,
    emitter: Option<Arc<dyn AgentEmitter>>,
    high_water_mark: i64,
}

impl ClientSyncAgentBuilder {
    pub fn with_emitter(mut self, emitter: Arc<dyn AgentEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Skips events up to `id`, e.g. when resuming from a saved position.
    pub fn with_high_water_mark(mut self, id: i64) -> Self {
        self.high_water_mark = id;
        self
    }

    /// Validates settings and starts transport plus agent task.
    /// Must be called inside a Tokio runtime.
    pub fn spawn(self) -> SyncResult<(AgentHandle, JoinHandle<()>)> {
        let settings = self.settings;
        settings.validate()?;

        let http = CatchUpClient::new(settings.server_url()?, settings.connect_timeout())?;
        let transport_config = TransportConfig {
            url: settings.push_url()?,
            connect_timeout: settings.connect_timeout(),
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
            ping_interval: PUSH_PING_INTERVAL,
        };

        info!(
            server = %settings.server_url,
            push = %transport_config.url,
            "Starting sync agent"
        );

        let (transport, transport_rx) = Transport::spawn(transport_config);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let status = Arc::new(RwLock::new(AgentStatus {
            high_water_mark: self.high_water_mark.max(0),
            ..Default::default()
        }));

        let agent = AgentLoop {
            reconciler: Reconciler::new(settings.recent_ids_capacity, settings.dedup_window())
                .with_high_water_mark(self.high_water_mark),
            link: LinkMachine::new(settings.failure_threshold),
            observed: ObservedState::default(),
            applied: 0,
            last_error: None,
            http,
            transport,
            status: status.clone(),
            emitter: self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter)),
            settings,
        };
        let task = tokio::spawn(agent.run(transport_rx, commands_rx));

        Ok((
            AgentHandle {
                commands: commands_tx,
                status,
            },
            task,
        ))
    }
}

// =============================================================================
// Agent Loop
// =============================================================================

struct AgentLoop {
    settings: ClientSettings,
    http: CatchUpClient,
    transport: TransportHandle,
    link: LinkMachine,
    reconciler: Reconciler,
    observed: ObservedState,
    applied: u64,
    last_error: Option<String>,
    status: Arc<RwLock<AgentStatus>>,
    emitter: Arc<dyn AgentEmitter>,
}

impl AgentLoop {
    async fn run(
        mut self,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<AgentCommand>,
    ) {
        self.seed_status().await;
        self.publish_status().await;

        let mut poll = interval(self.settings.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = interval(self.settings.statistics_interval());
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = transport_rx.recv() => match event {
                    Some(TransportEvent::Connected) => self.on_push_up(),
                    Some(TransportEvent::Message(msg)) => self.on_message(msg).await,
                    Some(TransportEvent::Disconnected(reason)) => self.on_push_down(reason),
                    None => {
                        warn!("Push transport stopped unexpectedly");
                        break;
                    }
                },

                _ = poll.tick(), if self.link.is_polling() => self.poll_once().await,

                _ = stats.tick(), if self.link.is_polling() => self.refresh_statistics().await,

                cmd = commands.recv() => match cmd {
                    Some(AgentCommand::Retry) => self.retry(),
                    Some(AgentCommand::Shutdown) | None => break,
                },
            }
            self.publish_status().await;
        }

        let _ = self.transport.shutdown().await;
        info!("Sync agent stopped");
    }

    async fn seed_status(&mut self) {
        match self.http.status().await {
            Ok(status) => {
                self.observed.absorb_status(&status);
                self.emitter.emit_state(&self.observed);
            }
            Err(e) => debug!(error = %e, "Initial status read failed"),
        }
    }

    fn change_mode(&self, change: Option<ModeChange>) {
        if let Some(change) = change {
            info!(from = %change.from, to = %change.to, "Link mode changed");
            self.emitter.emit_mode(change);
        }
    }

    // -------------------------------------------------------------------------
    // Push
    // -------------------------------------------------------------------------

    fn on_push_up(&mut self) {
        let change = self.link.push_up();
        self.change_mode(change);
    }

    async fn on_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::NewEvent(payload) => {
                // IDs are gapless, so a jump means pushes were skipped (the hub
                // drops frames for a lagging subscriber). Fill in from the log
                // before applying this one.
                let hwm = self.reconciler.high_water_mark();
                if payload.event.id > hwm + 1 {
                    debug!(
                        id = payload.event.id,
                        high_water_mark = hwm,
                        "Gap before pushed event; catching up"
                    );
                    if let Err(e) = self.catch_up().await {
                        warn!(error = %e, "Gap catch-up failed");
                        self.fail(&e);
                    }
                }

                if self.reconcile(&payload.event) {
                    self.observed.absorb_broadcast(&payload);
                    self.emitter.emit_event(&payload.event);
                    self.emitter.emit_state(&self.observed);
                } else if payload.event.id == self.reconciler.high_water_mark() {
                    // Already applied by catch-up; the pushed snapshot is still the latest.
                    self.observed.absorb_broadcast(&payload);
                    self.emitter.emit_state(&self.observed);
                }
            }
            ServerMessage::ConnectionStatus(status) => {
                debug!(
                    last_event_id = status.last_event_id,
                    high_water_mark = self.reconciler.high_water_mark(),
                    "Hub greeting"
                );
                // The hub greets after subscribing us, so anything older is
                // in the log and anything newer will be pushed.
                if let Err(e) = self.catch_up().await {
                    warn!(error = %e, "Catch-up after connect failed");
                    self.fail(&e);
                }
            }
            ServerMessage::Pong { .. } => debug!("Received pong"),
        }
    }

    fn on_push_down(&mut self, reason: String) {
        match self.link.push_down() {
            Some(change) => {
                warn!(reason = %reason, "Push channel unavailable; falling back to polling");
                self.change_mode(Some(change));
            }
            None => {
                debug!(reason = %reason, "Push reconnect attempt failed");
                return;
            }
        }
        self.last_error = Some(reason);
    }

    // -------------------------------------------------------------------------
    // Poll
    // -------------------------------------------------------------------------

    async fn poll_once(&mut self) {
        match self.catch_up().await {
            Ok(()) => self.link.poll_succeeded(),
            Err(e) => {
                self.fail(&e);
                let change = self.link.poll_failed();
                if change.is_some() {
                    let exhausted = SyncError::PollExhausted {
                        failures: self.link.consecutive_failures(),
                    };
                    error!(error = %exhausted, "Manual refresh required");
                    self.change_mode(change);
                    self.emitter.emit_error(&exhausted.to_string(), false);
                    self.last_error = Some(exhausted.to_string());
                }
            }
        }
    }

    async fn refresh_statistics(&mut self) {
        match self.http.statistics().await {
            Ok(statistics) => {
                if statistics != self.observed.statistics {
                    self.observed.statistics = statistics;
                    self.emitter.emit_state(&self.observed);
                }
            }
            Err(e) => debug!(error = %e, "Statistics refresh failed"),
        }
    }

    fn retry(&mut self) {
        info!("Manual refresh requested");
        let change = self.link.manual_retry();
        self.change_mode(change);
        self.transport.reconnect_now();
    }

    // -------------------------------------------------------------------------
    // Shared dedup path
    // -------------------------------------------------------------------------

    /// Pages through `GET /events?since=HWM` until a page brings nothing new.
    async fn catch_up(&mut self) -> SyncResult<()> {
        let page_size = self.settings.catch_up_page;
        loop {
            let since = self.reconciler.high_water_mark();
            let events = self.http.events_since(since, page_size).await?;

            let mut changed = false;
            for event in &events {
                if self.reconcile(event) {
                    self.observed.absorb_event(event);
                    self.emitter.emit_event(event);
                    changed = true;
                }
            }
            if changed {
                self.emitter.emit_state(&self.observed);
            }

            // The hub clamps `limit`, so a short page proves nothing. Stop on
            // an empty page, or one that did not move the HWM.
            if self.reconciler.high_water_mark() == since {
                return Ok(());
            }
        }
    }

    fn reconcile(&mut self, event: &Event) -> bool {
        match self.reconciler.accept(event) {
            Verdict::Applied => {
                self.applied += 1;
                true
            }
            verdict => {
                debug!(id = event.id, ?verdict, "Dropped duplicate event");
                false
            }
        }
    }

    fn fail(&mut self, err: &SyncError) {
        self.emitter.emit_error(&err.to_string(), err.is_retryable());
        self.last_error = Some(err.to_string());
    }

    async fn publish_status(&self) {
        let mut status = self.status.write().await;
        status.mode = self.link.mode();
        status.high_water_mark = self.reconciler.high_water_mark();
        status.consecutive_failures = self.link.consecutive_failures();
        status.last_error = self.last_error.clone();
        status.observed = self.observed.clone();
        status.applied = self.applied;
        status.dropped = self.reconciler.dropped();
    }
}
