//! # Doorwatch Daemon
//!
//! Wires the sensor, the monitor and the hub together and runs until
//! Ctrl-C or SIGTERM.
//!
//! ## Startup Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Config      defaults → doorwatch.toml → env → CLI flags             │
//! │  2. Database    SQLite file, migrations                                 │
//! │  3. Monitor     indicators + Fanout broadcaster                         │
//! │  4. Hub         /ws/events, /events, /statistics, /status, /health      │
//! │  5. Sensor      GPIO poll, or stdin console with --simulate             │
//! │                                                                         │
//! │  Shutdown runs the same list backwards.                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use doorwatch_db::{Database, DbConfig};
use doorwatch_engine::{
    AlarmMonitor, AppendOutcome, GpioPanel, GpioSensor, IndicatorPanel, LogPanel, MonitorHandle,
    SensorSource, SensorWatch, SimulatedSensor, SubmitOutcome,
};
use doorwatch_sync::{DoorwatchConfig, Fanout, HubServer, IndicatorMode, SensorKind};

#[derive(Debug, Parser)]
#[command(name = "doorwatch-daemon", version, about = "Door sensor monitor and event hub")]
struct Cli {
    /// Path to doorwatch.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database file (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Drive the sensor from stdin instead of GPIO
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = DoorwatchConfig::load(cli.config).context("loading configuration")?;
    if let Some(path) = cli.db {
        config.database.path = path;
    }
    if cli.simulate {
        config.sensor.source = SensorKind::Simulated;
    }

    // Database
    if let Some(parent) = config.database.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let db = Database::new(DbConfig::new(&config.database.path))
        .await
        .context("opening database")?;

    // Monitor
    let panel: Arc<dyn IndicatorPanel> = match config.indicators.mode {
        IndicatorMode::Gpio => Arc::new(GpioPanel::new(
            &config.indicators.ready_path,
            &config.indicators.countdown_path,
            &config.indicators.alarm_path,
        )),
        IndicatorMode::Log => Arc::new(LogPanel),
    };
    let fanout = Fanout::new(config.hub.channel_capacity);
    let (monitor, monitor_task) = AlarmMonitor::builder(db.clone(), config.monitor_config())
        .with_panel(panel)
        .with_broadcaster(Arc::new(fanout.clone()))
        .spawn();

    // Hub
    let hub = HubServer::new(config.hub.clone(), monitor.clone(), fanout)
        .start()
        .await
        .context("starting hub")?;

    // Sensor
    let simulated = match config.sensor.source {
        SensorKind::Simulated => Some(SimulatedSensor::default()),
        SensorKind::Gpio => None,
    };
    let source: Arc<dyn SensorSource> = match &simulated {
        Some(sim) => Arc::new(sim.clone()),
        None => Arc::new(GpioSensor::new(
            &config.sensor.gpio_value_path,
            config.sensor.active_high,
        )),
    };
    let watch = SensorWatch::spawn(source, config.sensor.poll_interval(), monitor.clone());

    info!(
        hub = %hub.local_addr(),
        sensor = ?config.sensor.source,
        escalation_secs = monitor.escalation_secs().await,
        "Doorwatch daemon running"
    );

    match simulated {
        Some(sim) => {
            tokio::select! {
                _ = console(sim, monitor.clone()) => {}
                _ = shutdown_signal() => {}
            }
        }
        None => shutdown_signal().await,
    }

    watch.shutdown().await;
    if let Err(e) = hub.shutdown().await {
        warn!(error = %e, "Hub already stopped");
    }
    monitor.shutdown().await;
    let _ = monitor_task.await;
    db.close().await;

    info!("Daemon shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,doorwatch=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// =============================================================================
// Simulation Console
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Open,
    Close,
    Ack,
    Timer(f64),
    Status,
    Help,
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = match words.next() {
            Some("open") => ConsoleCommand::Open,
            Some("close") => ConsoleCommand::Close,
            Some("ack") => ConsoleCommand::Ack,
            Some("status") => ConsoleCommand::Status,
            Some("help") | Some("?") => ConsoleCommand::Help,
            Some("timer") => {
                let Some(raw) = words.next() else {
                    bail!("usage: timer <seconds>");
                };
                let secs: f64 = raw
                    .parse()
                    .with_context(|| format!("'{raw}' is not a number"))?;
                ConsoleCommand::Timer(secs)
            }
            Some(other) => bail!("unknown command '{other}' (try 'help')"),
            None => bail!("empty command"),
        };
        if words.next().is_some() {
            bail!("too many arguments");
        }
        Ok(command)
    }
}

const HELP: &str = "commands: open | close | ack | timer <secs> | status | help";

/// Reads commands from stdin until EOF.
async fn console(sensor: SimulatedSensor, monitor: MonitorHandle) {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Console closed");
                // Keep running until a signal arrives.
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Console read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<ConsoleCommand>() {
            Ok(command) => run_command(command, &sensor, &monitor).await,
            Err(e) => println!("{e:#}"),
        }
    }
}

async fn run_command(command: ConsoleCommand, sensor: &SimulatedSensor, monitor: &MonitorHandle) {
    match command {
        ConsoleCommand::Open => sensor.set_open(true),
        ConsoleCommand::Close => sensor.set_open(false),
        ConsoleCommand::Ack => match monitor.acknowledge().await {
            Ok(SubmitOutcome::Accepted { .. }) => println!("escalation acknowledged"),
            Ok(SubmitOutcome::Rejected(_)) => println!("no escalation running"),
            Err(e) => println!("acknowledge failed: {e}"),
        },
        ConsoleCommand::Timer(secs) => match monitor.set_escalation_duration(secs).await {
            Ok(AppendOutcome::Recorded { event, .. }) => println!("{}", event.description),
            Ok(AppendOutcome::Suppressed(reason)) => {
                println!("duration stored; event suppressed ({reason:?})")
            }
            Err(e) => println!("cannot set duration: {e}"),
        },
        ConsoleCommand::Status => match monitor.status().await {
            Ok(status) => println!(
                "door={} alarm={} timer_active={} timer_set={}s",
                status.door_status, status.alarm_status, status.timer_active, status.timer_set
            ),
            Err(e) => println!("status unavailable: {e}"),
        },
        ConsoleCommand::Help => println!("{HELP}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_commands_parse() {
        assert_eq!("open".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Open);
        assert_eq!(" close ".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Close);
        assert_eq!("ack".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Ack);
        assert_eq!(
            "timer 12.5".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Timer(12.5)
        );
    }

    #[test]
    fn test_console_rejects_bad_input() {
        assert!("timer".parse::<ConsoleCommand>().is_err());
        assert!("timer soon".parse::<ConsoleCommand>().is_err());
        assert!("open now".parse::<ConsoleCommand>().is_err());
        assert!("explode".parse::<ConsoleCommand>().is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["doorwatch-daemon", "--simulate", "--db", "/tmp/door.db"]);
        assert!(cli.simulate);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/door.db")));
        assert!(cli.config.is_none());
    }
}
