//! # Push Transport
//!
//! WebSocket client for the hub's push channel, with automatic reconnection.
//! It only moves frames; deciding what an event means is the agent's job.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Push Connection States                               │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure / timeout             │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │  Backoff   │◄── reconnect_now() │
//! │        │              └─────┬──────┘  └─────┬──────┘    skips the wait │
//! │        │                    │               │                           │
//! │        │              close / error         │  timer expired            │
//! │        │                    ▼               │                           │
//! │        │              ┌────────────┐        │                           │
//! │        └───────────── │Reconnecting│ ◄──────┘                          │
//! │        (shutdown)     └────────────┘                                    │
//! │                                                                         │
//! │  Every failed attempt and every drop is reported as                     │
//! │  TransportEvent::Disconnected; every handshake as Connected.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerMessage};

// =============================================================================
// Transport State
// =============================================================================

/// Connection state of the push transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next attempt.
    Backoff,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// What the transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed.
    Connected,
    /// A decoded hub message.
    Message(ServerMessage),
    /// An attempt failed or a live connection dropped.
    Disconnected(String),
}

// =============================================================================
// Transport Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// ws:// or wss:// URL of the push channel.
    pub url: Url,

    /// Bound on TCP connect plus WebSocket handshake.
    pub connect_timeout: Duration,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    /// Interval for application-level `ping` messages.
    pub ping_interval: Duration,
}

impl TransportConfig {
    pub fn new(url: Url) -> Self {
        TransportConfig {
            url,
            connect_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Control side of a running transport.
#[derive(Clone)]
pub struct TransportHandle {
    state: Arc<RwLock<ConnectionState>>,
    kick_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl TransportHandle {
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Cuts a pending backoff short. No effect while connected.
    pub fn reconnect_now(&self) {
        let _ = self.kick_tx.try_send(());
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("transport already stopped".into()))
    }
}

// =============================================================================
// Push Transport
// =============================================================================

/// Reconnecting push-channel client.
///
/// ```rust,ignore
/// let (handle, mut events) = Transport::spawn(TransportConfig::new(url));
/// while let Some(event) = events.recv().await {
///     match event {
///         TransportEvent::Message(ServerMessage::NewEvent(b)) => { /* ... */ }
///         _ => {}
///     }
/// }
/// ```
pub struct Transport {
    config: TransportConfig,
    state: Arc<RwLock<ConnectionState>>,
    events_tx: mpsc::Sender<TransportEvent>,
    kick_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum LoopExit {
    Dropped(String),
    Shutdown,
}

impl Transport {
    /// Spawns the background connection task.
    pub fn spawn(config: TransportConfig) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (kick_tx, kick_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let transport = Transport {
            config,
            state: state.clone(),
            events_tx,
            kick_rx,
            shutdown_rx,
        };
        tokio::spawn(transport.run());

        (
            TransportHandle {
                state,
                kick_tx,
                shutdown_tx,
            },
            events_rx,
        )
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn report(&self, event: TransportEvent) -> bool {
        self.events_tx.send(event).await.is_ok()
    }

    async fn run(mut self) {
        info!(url = %self.config.url, "Push transport starting");
        let mut backoff = self.create_backoff();

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                break;
            }

            self.set_state(ConnectionState::Connecting).await;
            let reason = tokio::select! {
                result = connect_with_timeout(&self.config) => match result {
                    Ok(stream) => {
                        info!("Push channel connected");
                        self.set_state(ConnectionState::Connected).await;
                        backoff.reset();
                        if !self.report(TransportEvent::Connected).await {
                            break;
                        }
                        match self.connection_loop(stream).await {
                            LoopExit::Shutdown => break,
                            LoopExit::Dropped(reason) => reason,
                        }
                    }
                    Err(e) => e.to_string(),
                },
                _ = self.shutdown_rx.recv() => break,
            };

            debug!(reason = %reason, "Push channel down");
            self.set_state(ConnectionState::Backoff).await;
            if !self.report(TransportEvent::Disconnected(reason)).await {
                break;
            }

            let wait = backoff.next_backoff().unwrap_or(self.config.max_backoff);
            debug!(?wait, "Waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                Some(()) = self.kick_rx.recv() => {
                    debug!("Reconnect requested; skipping backoff");
                    backoff.reset();
                }
                _ = self.shutdown_rx.recv() => break,
            }
            self.set_state(ConnectionState::Reconnecting).await;
        }

        self.set_state(ConnectionState::Disconnected).await;
        info!("Push transport stopped");
    }

    async fn connection_loop(&mut self, stream: WsStream) -> LoopExit {
        let (mut write, mut read) = stream.split();

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match ServerMessage::from_json(text.as_str()) {
                        Ok(msg) => {
                            debug!(msg_type = msg.type_name(), "Received message");
                            if !self.report(TransportEvent::Message(msg)).await {
                                return LoopExit::Shutdown;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring unparseable hub message"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = write.send(WsMessage::Pong(data)).await {
                            return LoopExit::Dropped(SyncError::from(e).to_string());
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Hub closed push channel");
                        return LoopExit::Dropped("closed by hub".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return LoopExit::Dropped(SyncError::from(e).to_string()),
                    None => return LoopExit::Dropped("stream ended".into()),
                },

                _ = ping_interval.tick() => {
                    let Ok(json) = ClientMessage::ping().to_json() else { continue };
                    if let Err(e) = write.send(WsMessage::Text(json.into())).await {
                        return LoopExit::Dropped(SyncError::from(e).to_string());
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return LoopExit::Shutdown;
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

async fn connect_with_timeout(config: &TransportConfig) -> SyncResult<WsStream> {
    match timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
        Ok(Ok((stream, response))) => {
            debug!(status = ?response.status(), "WebSocket handshake complete");
            Ok(stream)
        }
        Ok(Err(e)) => Err(SyncError::from(e)),
        Err(_) => Err(SyncError::Timeout(config.connect_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[tokio::test]
    async fn test_refused_connect_reports_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = TransportConfig::new(Url::parse(&format!("ws://127.0.0.1:{port}/ws/events")).unwrap());
        config.connect_timeout = Duration::from_millis(500);
        config.initial_backoff = Duration::from_millis(50);

        let (handle, mut events) = Transport::spawn(config);
        let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, TransportEvent::Disconnected(_)));

        handle.shutdown().await.unwrap();
    }
}
