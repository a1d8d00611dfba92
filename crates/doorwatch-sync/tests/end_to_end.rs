//! Hub and agents over real sockets: a monitor on an in-memory database, the
//! hub on an ephemeral loopback port, and agents pointed at it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use doorwatch_core::{DoorStatus, Event, EventBroadcast, EventType, Transition};
use doorwatch_db::{Database, DbConfig};
use doorwatch_engine::{AlarmMonitor, EventBroadcaster, MonitorConfig, MonitorHandle};
use doorwatch_sync::{
    AgentEmitter, AgentHandle, ClientSettings, ClientSyncAgent, Fanout, HubHandle, HubServer,
    HubSettings, LinkMode, ModeChange, ObservedState,
};

// =============================================================================
// Fixtures
// =============================================================================

struct Server {
    monitor: MonitorHandle,
    fanout: Fanout,
    hub: HubHandle,
}

fn loopback(port: u16) -> HubSettings {
    HubSettings {
        bind_addr: "127.0.0.1".into(),
        port,
        channel_capacity: 64,
    }
}

async fn server() -> Server {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let fanout = Fanout::new(64);
    let (monitor, _task) = AlarmMonitor::builder(db, MonitorConfig::default())
        .with_broadcaster(Arc::new(fanout.clone()))
        .spawn();

    let hub = HubServer::new(loopback(0), monitor.clone(), fanout.clone())
        .start()
        .await
        .unwrap();

    Server {
        monitor,
        fanout,
        hub,
    }
}

/// Starts a second hub for the same monitor on `port`, once the old listener
/// has let go of it.
async fn restart_hub(server: &Server, port: u16) -> HubHandle {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let started = HubServer::new(loopback(port), server.monitor.clone(), server.fanout.clone())
            .start()
            .await;
        match started {
            Ok(hub) => return hub,
            Err(e) => {
                assert!(Instant::now() < deadline, "could not rebind {port}: {e}");
                sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

/// A loopback port nothing listens on.
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn fast_settings(server_url: &str) -> ClientSettings {
    ClientSettings {
        connect_timeout_ms: 1_000,
        poll_interval_ms: 100,
        statistics_interval_ms: 200,
        initial_backoff_ms: 50,
        max_backoff_secs: 1,
        ..ClientSettings::for_server(server_url)
    }
}

#[derive(Default)]
struct Seen {
    events: Mutex<Vec<Event>>,
    modes: Mutex<Vec<ModeChange>>,
    errors: Mutex<Vec<(String, bool)>>,
}

impl Seen {
    fn ids(&self) -> Vec<i64> {
        self.events.lock().unwrap().iter().map(|e| e.id).collect()
    }

    fn modes(&self) -> Vec<ModeChange> {
        self.modes.lock().unwrap().clone()
    }
}

impl AgentEmitter for Seen {
    fn emit_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn emit_state(&self, _state: &ObservedState) {}

    fn emit_mode(&self, change: ModeChange) {
        self.modes.lock().unwrap().push(change);
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        self.errors.lock().unwrap().push((message.to_string(), retryable));
    }
}

fn spawn_agent(settings: ClientSettings) -> (AgentHandle, Arc<Seen>) {
    let seen = Arc::new(Seen::default());
    let (agent, _task) = ClientSyncAgent::builder(settings)
        .with_emitter(seen.clone())
        .spawn()
        .unwrap();
    (agent, seen)
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_mode(agent: &AgentHandle, mode: LinkMode) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while agent.mode().await != mode {
        assert!(Instant::now() < deadline, "timed out waiting for {mode}");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_subscribers(hub: &HubHandle, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while hub.subscriber_count().await != n {
        assert!(Instant::now() < deadline, "timed out waiting for {n} subscribers");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn note(monitor: &MonitorHandle, n: usize) {
    monitor
        .record(EventType::Other("note".into()), format!("note {n}"))
        .await
        .unwrap();
}

// =============================================================================
// Push
// =============================================================================

#[tokio::test]
async fn test_push_delivers_live_events() {
    let server = server().await;
    let (agent, seen) = spawn_agent(fast_settings(&server.hub.base_url()));

    wait_for_mode(&agent, LinkMode::Push).await;
    wait_for_subscribers(&server.hub, 1).await;

    server.monitor.submit(Transition::SensorOpened).await.unwrap();
    wait_until("sensor_open", || seen.ids().len() == 1).await;

    let status = agent.status().await;
    assert_eq!(status.observed.door_status, DoorStatus::Open);
    assert_eq!(status.observed.statistics.total_events, 1);
    assert_eq!(status.observed.statistics.door_open_events, 1);
    assert_eq!(status.observed.timer_set, Some(30.0));
    assert_eq!(status.high_water_mark, 1);
    assert_eq!(
        seen.events.lock().unwrap()[0].event_type,
        EventType::SensorOpen
    );

    agent.shutdown().await;
}

#[tokio::test]
async fn test_every_subscriber_gets_each_event() {
    let server = server().await;
    let (first, seen_first) = spawn_agent(fast_settings(&server.hub.base_url()));
    let (second, seen_second) = spawn_agent(fast_settings(&server.hub.base_url()));
    wait_for_subscribers(&server.hub, 2).await;

    server.monitor.submit(Transition::SensorOpened).await.unwrap();
    server.monitor.submit(Transition::SensorClosed).await.unwrap();

    wait_until("both agents", || {
        seen_first.ids() == vec![1, 2] && seen_second.ids() == vec![1, 2]
    })
    .await;

    first.shutdown().await;
    second.shutdown().await;
}

// =============================================================================
// Catch-up and dedup
// =============================================================================

#[tokio::test]
async fn test_connect_catches_up_on_missed_events() {
    let server = server().await;
    for n in 0..3 {
        note(&server.monitor, n).await;
    }

    let (agent, seen) = spawn_agent(fast_settings(&server.hub.base_url()));
    wait_until("backlog", || seen.ids() == vec![1, 2, 3]).await;
    wait_for_mode(&agent, LinkMode::Push).await;

    assert_eq!(agent.status().await.high_water_mark, 3);
    agent.shutdown().await;
}

#[tokio::test]
async fn test_catch_up_racing_push_applies_each_event_once() {
    let server = server().await;
    for n in 0..5 {
        note(&server.monitor, n).await;
    }

    let (agent, seen) = spawn_agent(fast_settings(&server.hub.base_url()));
    // Publish while the agent is connecting and catching up.
    for n in 5..20 {
        note(&server.monitor, n).await;
        sleep(Duration::from_millis(5)).await;
    }

    wait_until("all twenty", || seen.ids().len() >= 20).await;
    sleep(Duration::from_millis(200)).await;

    let ids = seen.ids();
    let unique: HashSet<i64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(unique.len(), 20);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(agent.status().await.high_water_mark, 20);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_catch_up_pages_past_hub_page_cap() {
    let server = server().await;
    for n in 0..300 {
        note(&server.monitor, n).await;
    }

    // The hub serves at most 200 per page, whatever the client asks for.
    let mut settings = fast_settings(&server.hub.base_url());
    settings.catch_up_page = 500;
    let (agent, seen) = spawn_agent(settings);

    wait_until("backlog", || seen.ids().len() >= 300).await;
    wait_for_mode(&agent, LinkMode::Push).await;
    wait_for_subscribers(&server.hub, 1).await;

    note(&server.monitor, 300).await;
    wait_until("live event", || seen.ids().len() >= 301).await;

    assert_eq!(seen.ids(), (1..=301).collect::<Vec<i64>>());
    assert_eq!(agent.status().await.high_water_mark, 301);
    agent.shutdown().await;
}

#[tokio::test]
async fn test_lagging_subscriber_recovers_skipped_events() {
    // The monitor does not publish here; the burst below is pushed by hand
    // into a one-slot fanout so the subscriber is guaranteed to lag.
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let (monitor, _task) = AlarmMonitor::builder(db, MonitorConfig::default()).spawn();
    let fanout = Fanout::new(1);
    let hub = HubServer::new(loopback(0), monitor.clone(), fanout.clone())
        .start()
        .await
        .unwrap();

    let (agent, seen) = spawn_agent(fast_settings(&hub.base_url()));
    wait_for_mode(&agent, LinkMode::Push).await;
    wait_for_subscribers(&hub, 1).await;
    // Let the connect catch-up run against the empty log.
    sleep(Duration::from_millis(200)).await;

    for n in 0..10 {
        note(&monitor, n).await;
    }
    let statistics = monitor.statistics().await.unwrap();
    let state = monitor.snapshot().state;
    for event in monitor.events_since(0, 100).await.unwrap() {
        fanout.publish(&EventBroadcast {
            event,
            door_status: state.door_status(),
            alarm_status: state.alarm_status(),
            statistics,
            timer_set: Some(30.0),
        });
    }

    wait_until("skipped events", || seen.ids() == (1..=10).collect::<Vec<i64>>()).await;
    let status = agent.status().await;
    assert_eq!(status.high_water_mark, 10);
    assert_eq!(status.observed.statistics.total_events, 10);
    assert_eq!(status.mode, LinkMode::Push);

    agent.shutdown().await;
}

// =============================================================================
// Poll fallback
// =============================================================================

#[tokio::test]
async fn test_push_reestablished_stops_polling() {
    let server = server().await;
    let mut settings = fast_settings(&server.hub.base_url());
    // Keep polling through the outage instead of giving up.
    settings.failure_threshold = 1_000;

    let (agent, seen) = spawn_agent(settings);
    wait_for_mode(&agent, LinkMode::Push).await;

    let port = server.hub.local_addr().port();
    server.hub.shutdown().await.unwrap();
    wait_for_mode(&agent, LinkMode::Poll).await;

    let hub = restart_hub(&server, port).await;
    wait_for_mode(&agent, LinkMode::Push).await;
    wait_for_subscribers(&hub, 1).await;
    // Connect catch-up.
    sleep(Duration::from_millis(300)).await;

    let reads = hub.catch_up_reads();
    assert!(reads >= 1);
    // Six poll intervals.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(hub.catch_up_reads(), reads, "agent still polling over push");
    assert!(seen.modes().contains(&ModeChange {
        from: LinkMode::Poll,
        to: LinkMode::Push,
    }));

    server.monitor.submit(Transition::SensorOpened).await.unwrap();
    wait_until("pushed event", || seen.ids() == vec![1]).await;

    agent.shutdown().await;
    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_push_falls_back_to_polling() {
    let server = server().await;
    let mut settings = fast_settings(&server.hub.base_url());
    settings.push_url = Some(format!("ws://127.0.0.1:{}/ws/events", dead_port()));

    let (agent, seen) = spawn_agent(settings);
    wait_for_mode(&agent, LinkMode::Poll).await;
    assert_eq!(
        seen.modes()[0],
        ModeChange {
            from: LinkMode::Connecting,
            to: LinkMode::Poll
        }
    );

    server.monitor.submit(Transition::SensorOpened).await.unwrap();
    wait_until("polled event", || seen.ids() == vec![1]).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = agent.status().await;
        if status.observed.statistics.total_events == 1 {
            assert_eq!(status.observed.door_status, DoorStatus::Open);
            assert_eq!(status.consecutive_failures, 0);
            break;
        }
        assert!(Instant::now() < deadline, "statistics never refreshed");
        sleep(Duration::from_millis(20)).await;
    }

    agent.shutdown().await;
}

#[tokio::test]
async fn test_poll_failures_end_in_disconnected_until_retry() {
    let port = dead_port();
    let mut settings = fast_settings(&format!("http://127.0.0.1:{port}"));
    settings.failure_threshold = 2;
    settings.connect_timeout_ms = 300;

    let (agent, seen) = spawn_agent(settings);
    wait_for_mode(&agent, LinkMode::Disconnected).await;

    let status = agent.status().await;
    assert_eq!(status.consecutive_failures, 2);
    assert!(status.last_error.unwrap().contains("2 consecutive failures"));
    assert!(seen
        .errors
        .lock()
        .unwrap()
        .iter()
        .any(|(message, retryable)| !retryable && message.contains("gave up")));

    agent.retry().await.unwrap();
    wait_until("manual retry", || {
        seen.modes().contains(&ModeChange {
            from: LinkMode::Disconnected,
            to: LinkMode::Poll,
        })
    })
    .await;

    agent.shutdown().await;
}

// =============================================================================
// HTTP reads
// =============================================================================

#[tokio::test]
async fn test_read_endpoints() {
    let server = server().await;
    server.monitor.submit(Transition::SensorOpened).await.unwrap();
    for n in 0..3 {
        note(&server.monitor, n).await;
    }

    let base = server.hub.base_url();
    let http = reqwest::Client::new();

    let page: serde_json::Value = http
        .get(format!("{base}/events?since=1&limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<i64> = page["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![2, 3]);

    let bad = http
        .get(format!("{base}/events?since=-5"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 400);
    let body: serde_json::Value = bad.json().await.unwrap();
    assert!(body["error"].is_string());

    let stats: serde_json::Value = http
        .get(format!("{base}/statistics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_events"], 4);
    assert_eq!(stats["door_open_events"], 1);

    let status: serde_json::Value = http
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["door_status"], "Open");
    assert_eq!(status["alarm_status"], "Inactive");
    assert_eq!(status["timer_active"], true);
    assert_eq!(status["last_event"]["id"], 4);

    let health = http
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "OK");
}
