//! # Doorwatch Client
//!
//! Terminal observer: one sync agent, printed as a running log.
//!
//! ```text
//! 2024-05-01 14:00:00  #12 sensor_open      Door opened
//!                      door=Open alarm=Inactive  total=12 open=6 close=6 alarm=0
//! [link] push -> poll
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use doorwatch_core::Event;
use doorwatch_sync::{
    AgentEmitter, AgentHandle, ClientSyncAgent, DoorwatchConfig, LinkMode, ModeChange,
    ObservedState,
};

#[derive(Debug, Parser)]
#[command(name = "doorwatch-client", version, about = "Watch a doorwatch hub from the terminal")]
struct Cli {
    /// Path to doorwatch.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hub base URL, e.g. http://door.local:8765
    #[arg(long)]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = DoorwatchConfig::load(cli.config).context("loading configuration")?;
    if let Some(server) = cli.server {
        config.client.server_url = server;
    }
    let settings = config.client;

    let view = Arc::new(TerminalView::new(settings.display_utc_offset_minutes));
    let (agent, task) = ClientSyncAgent::builder(settings)
        .with_emitter(view)
        .spawn()
        .context("starting sync agent")?;

    tokio::select! {
        _ = console(agent.clone()) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    agent.shutdown().await;
    let _ = task.await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,doorwatch=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `retry` forces a reconnect, `status` prints the agent's view, `quit` exits.
async fn console(agent: AgentHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "" => {}
            "retry" | "r" => {
                if let Err(e) = agent.retry().await {
                    warn!(error = %e, "Retry failed");
                }
            }
            "status" | "s" => {
                let status = agent.status().await;
                println!(
                    "[status] mode={} hwm={} applied={} dropped={} failures={}",
                    status.mode,
                    status.high_water_mark,
                    status.applied,
                    status.dropped,
                    status.consecutive_failures
                );
            }
            "quit" | "q" => return,
            other => println!("unknown command '{other}' (retry | status | quit)"),
        }
    }
    // stdin closed: keep watching until Ctrl-C.
    std::future::pending::<()>().await;
}

// =============================================================================
// Terminal Presentation
// =============================================================================

struct TerminalView {
    offset: FixedOffset,
}

impl TerminalView {
    fn new(offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(offset_minutes.saturating_mul(60)).unwrap_or_else(|| {
            warn!(offset_minutes, "Display offset out of range; using UTC");
            Utc.fix()
        });
        TerminalView { offset }
    }

    fn local_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

impl AgentEmitter for TerminalView {
    fn emit_event(&self, event: &Event) {
        println!(
            "{}  #{:<4} {:<20} {}",
            self.local_time(event.timestamp),
            event.id,
            event.event_type.as_str(),
            event.description
        );
    }

    fn emit_state(&self, state: &ObservedState) {
        let stats = state.statistics;
        println!(
            "{:21}door={} alarm={}  total={} open={} close={} alarm={}",
            "",
            state.door_status,
            state.alarm_status,
            stats.total_events,
            stats.door_open_events,
            stats.door_close_events,
            stats.alarm_events
        );
    }

    fn emit_mode(&self, change: ModeChange) {
        let note = match change.to {
            LinkMode::Disconnected => "  (manual refresh required: type 'retry')",
            _ => "",
        };
        println!("[link] {} -> {}{}", change.from, change.to, note);
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        if !retryable {
            println!("[error] {message}");
        }
    }
}
