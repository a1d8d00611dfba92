//! # Broadcast Hub
//!
//! Serves the push channel and the catch-up reads. The monitor publishes each
//! persisted event into a [`Fanout`]; every connected observer gets its own
//! forwarding task, so one stalled socket never holds up the others.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Broadcast Hub                                    │
//! │                                                                         │
//! │  AlarmMonitor ── publish(&EventBroadcast) ──► Fanout                    │
//! │                  (serialized once)              │ broadcast::Sender     │
//! │                                                 ▼                       │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      HubServer (Axum)                           │   │
//! │  │                                                                 │   │
//! │  │  /ws/events ──▶ WebSocket upgrade ──▶ per-connection tasks:     │   │
//! │  │                   forward (broadcast → socket, lag → warn)      │   │
//! │  │                   ping (keepalive)                              │   │
//! │  │                   receive (client ping → pong)                  │   │
//! │  │                                                                 │   │
//! │  │  GET /events?since=&limit=   catch-up page (ascending IDs)      │   │
//! │  │  GET /statistics             StatisticsSnapshot                 │   │
//! │  │  GET /status                 door/alarm/timer + last event      │   │
//! │  │  GET /health                 "OK"                               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Delivery is best-effort. A lagging subscriber skips messages; the     │
//! │  resulting ID gap sends its agent to GET /events.                      │
//! │  Shutdown closes every push socket so agents fall back to polling.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use doorwatch_core::{EventBroadcast, EventPage};
use doorwatch_engine::{EngineError, EventBroadcaster, MonitorHandle};

use crate::config::{HubSettings, PUSH_PATH};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerMessage};

// =============================================================================
// Constants
// =============================================================================

/// Ping interval to keep connections alive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long a closing socket gets to flush its Close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Maximum inbound message size (64KB; clients only send pings).
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Page size when `limit` is omitted.
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

// =============================================================================
// Fanout
// =============================================================================

/// The hub's single writer: serializes each payload once and hands the same
/// frame to every subscriber.
#[derive(Clone)]
pub struct Fanout {
    tx: broadcast::Sender<Utf8Bytes>,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Fanout { tx }
    }

    fn subscribe(&self) -> broadcast::Receiver<Utf8Bytes> {
        self.tx.subscribe()
    }

    /// Number of live push subscriptions.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventBroadcaster for Fanout {
    fn publish(&self, payload: &EventBroadcast) {
        let frame = match ServerMessage::NewEvent(payload.clone()).to_json() {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                error!(error = %e, event_id = payload.event.id, "Failed to serialize broadcast");
                return;
            }
        };
        // No subscribers is not an error.
        let delivered = self.tx.send(frame).unwrap_or(0);
        debug!(event_id = payload.event.id, subscribers = delivered, "Event fanned out");
    }
}

// =============================================================================
// Hub State
// =============================================================================

/// A connected push subscriber.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// Shared state for the hub server.
struct HubState {
    monitor: MonitorHandle,
    fanout: Fanout,
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    /// Flips to `true` on shutdown; every push socket closes on it.
    closing: watch::Sender<bool>,
    /// `GET /events` requests served.
    catch_up_reads: AtomicU64,
}

// =============================================================================
// Hub Server
// =============================================================================

/// The HTTP + WebSocket server.
pub struct HubServer {
    settings: HubSettings,
    state: Arc<HubState>,
}

/// Handle for controlling the hub server.
#[derive(Clone)]
pub struct HubHandle {
    state: Arc<HubState>,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl HubHandle {
    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://<local_addr>`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.subscribers.read().await.len()
    }

    pub async fn subscribers(&self) -> Vec<Subscriber> {
        self.state.subscribers.read().await.values().cloned().collect()
    }

    /// Number of `GET /events` requests served so far.
    pub fn catch_up_reads(&self) -> u64 {
        self.state.catch_up_reads.load(Ordering::Relaxed)
    }

    /// Closes every push channel and stops the server.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.state.closing.send_replace(true);
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Hub shutdown channel closed".into()))
    }
}

impl HubServer {
    /// `fanout` must be the broadcaster the monitor publishes into.
    pub fn new(settings: HubSettings, monitor: MonitorHandle, fanout: Fanout) -> Self {
        let state = Arc::new(HubState {
            monitor,
            fanout,
            subscribers: RwLock::new(HashMap::new()),
            closing: watch::channel(false).0,
            catch_up_reads: AtomicU64::new(0),
        });
        HubServer { settings, state }
    }

    /// Binds the listener, spawns the server and returns a handle.
    pub async fn start(self) -> SyncResult<HubHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = Router::new()
            .route(PUSH_PATH, get(ws_handler))
            .route("/events", get(events_handler))
            .route("/statistics", get(statistics_handler))
            .route("/status", get(status_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone());

        let bind_addr = self.settings.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| SyncError::BindFailed {
                addr: bind_addr.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| SyncError::BindFailed {
            addr: bind_addr.clone(),
            reason: e.to_string(),
        })?;

        info!(addr = %local_addr, "Hub server started");

        tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await;
                info!("Hub server shutting down");
            })
            .await;
            if let Err(e) = result {
                error!(error = %e, "Hub server stopped with error");
            }
        });

        Ok(HubHandle {
            state: self.state,
            local_addr,
            shutdown_tx,
        })
    }
}

// =============================================================================
// HTTP Reads
// =============================================================================

/// Error body of every read endpoint: `{"error": "..."}`.
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Read endpoint failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    since: Option<i64>,
    limit: Option<u32>,
}

async fn events_handler(
    State(state): State<Arc<HubState>>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Json<EventPage>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let since = query.since.unwrap_or(0);
    if since < 0 {
        return Err(ApiError::BadRequest("since must not be negative".into()));
    }
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    state.catch_up_reads.fetch_add(1, Ordering::Relaxed);

    let events = state.monitor.events_since(since, limit).await?;
    Ok(Json(EventPage { events }))
}

async fn statistics_handler(State(state): State<Arc<HubState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.monitor.statistics().await?))
}

async fn status_handler(State(state): State<Arc<HubState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.monitor.status().await?))
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

// =============================================================================
// Push Channel
// =============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    debug!(addr = %addr, "Push channel upgrade");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<HubState>, addr: SocketAddr) {
    let id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let mut closing = state.closing.subscribe();

    // Subscribe before the greeting so nothing published after it is missed.
    let mut broadcast_rx = state.fanout.subscribe();

    let last_event_id = match state.monitor.last_event_id().await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Could not read last event id for greeting");
            0
        }
    };
    if let Err(e) = send_message(&mut sender, &ServerMessage::connected(last_event_id)).await {
        warn!(subscriber = %id, error = %e, "Failed to send greeting");
        return;
    }

    state.subscribers.write().await.insert(
        id,
        Subscriber {
            id,
            addr,
            connected_at: Utc::now(),
        },
    );
    info!(subscriber = %id, addr = %addr, last_event_id, "Subscriber connected");

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(64);

    let mut outgoing_handle = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let forward_tx = outgoing_tx.clone();
    let forward_handle = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(frame) => {
                    if forward_tx.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The next frame shows the client a gap in event IDs,
                    // which it fills from GET /events.
                    warn!(subscriber = %id, skipped, "Subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let ping_tx = outgoing_tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_interval = interval(PING_INTERVAL);
        ping_interval.tick().await;
        loop {
            ping_interval.tick().await;
            if ping_tx.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            next = receiver.next() => next,
            _ = async { let _ = closing.wait_for(|flag| *flag).await; } => {
                debug!(subscriber = %id, "Hub closing push channel");
                let _ = outgoing_tx.send(Message::Close(None)).await;
                break;
            }
        };
        match next {
            Some(Ok(Message::Text(text))) => match ClientMessage::from_json(text.as_str()) {
                Ok(ClientMessage::Ping { .. }) => {
                    if let Ok(json) = ServerMessage::pong().to_json() {
                        let _ = outgoing_tx.send(Message::Text(json.into())).await;
                    }
                }
                Err(e) => {
                    debug!(subscriber = %id, error = %e, "Ignoring unknown client message");
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = outgoing_tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) => {
                debug!(subscriber = %id, "Client requested close");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(subscriber = %id, error = %e, "Push channel error");
                break;
            }
            None => break,
        }
    }

    ping_handle.abort();
    forward_handle.abort();
    drop(outgoing_tx);
    // Let queued frames (a Close, a final pong) reach the socket.
    if tokio::time::timeout(CLOSE_GRACE, &mut outgoing_handle).await.is_err() {
        outgoing_handle.abort();
    }
    if state.subscribers.write().await.remove(&id).is_some() {
        info!(subscriber = %id, "Subscriber disconnected");
    }
}

async fn send_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> SyncResult<()> {
    let json = msg.to_json()?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SyncError::WebSocketError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use doorwatch_core::{AlarmStatus, DoorStatus, Event, EventType, StatisticsSnapshot};

    fn payload(id: i64) -> EventBroadcast {
        EventBroadcast {
            event: Event {
                id,
                event_type: EventType::SensorOpen,
                description: "Door opened".into(),
                timestamp: Utc::now(),
            },
            door_status: DoorStatus::Open,
            alarm_status: AlarmStatus::Inactive,
            statistics: StatisticsSnapshot {
                total_events: id,
                door_open_events: id,
                ..Default::default()
            },
            timer_set: Some(30.0),
        }
    }

    #[tokio::test]
    async fn test_fanout_delivers_same_frame_to_every_subscriber() {
        let fanout = Fanout::new(8);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();
        assert_eq!(fanout.receiver_count(), 2);

        fanout.publish(&payload(1));

        let frame_a = a.recv().await.unwrap();
        let frame_b = b.recv().await.unwrap();
        assert_eq!(frame_a.as_str(), frame_b.as_str());
        match ServerMessage::from_json(frame_a.as_str()).unwrap() {
            ServerMessage::NewEvent(p) => assert_eq!(p.event.id, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fanout_without_subscribers_is_silent() {
        let fanout = Fanout::new(8);
        fanout.publish(&payload(1));
        assert_eq!(fanout.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking() {
        let fanout = Fanout::new(2);
        let mut slow = fanout.subscribe();
        let mut fast = fanout.subscribe();

        for id in 1..=5 {
            fanout.publish(&payload(id));
            assert!(fast.recv().await.is_ok());
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }
}
