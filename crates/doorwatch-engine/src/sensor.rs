//! # Sensor Watch
//!
//! Polls a [`SensorSource`] and turns level changes into transitions for the
//! monitor. Every observed edge is submitted; bounce protection lives in the
//! StateStore and the EventLog, not here.
//!
//! ```text
//!  GpioSensor / SimulatedSensor ──read()──► SensorWatch ──Transition──► MonitorHandle
//!                                           (every poll_interval)
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use doorwatch_core::Transition;

use crate::monitor::MonitorHandle;

/// Something that can report whether the door is open right now.
pub trait SensorSource: Send + Sync {
    /// `true` when the door is open.
    fn read(&self) -> io::Result<bool>;
}

// =============================================================================
// GPIO Sensor
// =============================================================================

/// Reads a sysfs GPIO value file (`/sys/class/gpio/gpioN/value`).
///
/// For a normally-open contact wired active-high, `1` means open.
#[derive(Debug, Clone)]
pub struct GpioSensor {
    value_path: PathBuf,
    active_high: bool,
}

impl GpioSensor {
    pub fn new(value_path: impl Into<PathBuf>, active_high: bool) -> Self {
        GpioSensor {
            value_path: value_path.into(),
            active_high,
        }
    }
}

impl SensorSource for GpioSensor {
    fn read(&self) -> io::Result<bool> {
        let raw = std::fs::read_to_string(&self.value_path)?;
        let high = match raw.trim() {
            "1" => true,
            "0" => false,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected GPIO value '{other}'"),
                ))
            }
        };
        Ok(high == self.active_high)
    }
}

// =============================================================================
// Simulated Sensor
// =============================================================================

/// Sensor whose level is set from code (the daemon's stdin, tests).
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    level: Arc<watch::Sender<bool>>,
}

impl SimulatedSensor {
    pub fn new(open: bool) -> Self {
        let (tx, _rx) = watch::channel(open);
        SimulatedSensor {
            level: Arc::new(tx),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.level.send_replace(open);
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SensorSource for SimulatedSensor {
    fn read(&self) -> io::Result<bool> {
        Ok(*self.level.borrow())
    }
}

// =============================================================================
// Watch Task
// =============================================================================

/// Handle for a running [`SensorWatch`].
pub struct SensorWatchHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SensorWatchHandle {
    /// Stops polling and waits for the task to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Polling loop feeding sensor edges to the monitor.
pub struct SensorWatch {
    source: Arc<dyn SensorSource>,
    interval: Duration,
    monitor: MonitorHandle,
    shutdown_rx: mpsc::Receiver<()>,
}

impl SensorWatch {
    pub fn spawn(
        source: Arc<dyn SensorSource>,
        interval: Duration,
        monitor: MonitorHandle,
    ) -> SensorWatchHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let watch = SensorWatch {
            source,
            interval,
            monitor,
            shutdown_rx,
        };
        let task = tokio::spawn(watch.run());
        SensorWatchHandle { shutdown_tx, task }
    }

    async fn run(mut self) {
        info!(interval = ?self.interval, "Sensor watch started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The StateStore starts closed, so an initially open door is an edge.
        let mut last = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let open = match self.source.read() {
                        Ok(open) => open,
                        Err(e) => {
                            warn!(error = %e, "Sensor read failed");
                            continue;
                        }
                    };
                    if open == last {
                        continue;
                    }
                    last = open;

                    let transition = if open {
                        Transition::SensorOpened
                    } else {
                        Transition::SensorClosed
                    };
                    debug!(?transition, "Sensor edge");
                    match self.monitor.submit(transition).await {
                        Ok(_) => {}
                        Err(e) if e.is_persistence() => {
                            warn!(error = %e, "Sensor edge applied but not persisted");
                        }
                        Err(e) => {
                            warn!(error = %e, "Monitor unavailable, sensor watch stopping");
                            break;
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!("Sensor watch stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{AlarmMonitor, MonitorConfig};
    use doorwatch_core::EventType;
    use doorwatch_db::{Database, DbConfig};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Simulated contact whose reads can be made to fail.
    #[derive(Default)]
    struct FlakySensor {
        level: SimulatedSensor,
        failing: AtomicBool,
    }

    impl SensorSource for FlakySensor {
        fn read(&self) -> io::Result<bool> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "bus error"));
            }
            self.level.read()
        }
    }

    async fn logged(monitor: &MonitorHandle) -> Vec<EventType> {
        monitor
            .events_since(0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    async fn wait_for_events(monitor: &MonitorHandle, expected: &[EventType]) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while logged(monitor).await != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {expected:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_gpio_sensor_levels() {
        let path = std::env::temp_dir().join(format!("doorwatch-gpio-{}", std::process::id()));

        std::fs::write(&path, "1\n").unwrap();
        assert!(GpioSensor::new(&path, true).read().unwrap());
        assert!(!GpioSensor::new(&path, false).read().unwrap());

        std::fs::write(&path, "0\n").unwrap();
        assert!(!GpioSensor::new(&path, true).read().unwrap());

        std::fs::write(&path, "x").unwrap();
        assert!(GpioSensor::new(&path, true).read().is_err());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_simulated_sensor() {
        let sensor = SimulatedSensor::default();
        assert!(!sensor.read().unwrap());
        let clone = sensor.clone();
        clone.set_open(true);
        assert!(sensor.read().unwrap());
    }

    #[tokio::test]
    async fn test_watch_submits_edges_only() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (monitor, _task) = AlarmMonitor::builder(db, MonitorConfig::default()).spawn();
        let sensor = Arc::new(FlakySensor::default());
        let watch = SensorWatch::spawn(sensor.clone(), Duration::from_millis(10), monitor.clone());

        // Closed and steady: nothing to submit.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(logged(&monitor).await.is_empty());

        // Failed reads are skipped, so the open is not seen yet.
        sensor.failing.store(true, Ordering::SeqCst);
        sensor.level.set_open(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(logged(&monitor).await.is_empty());
        assert!(!monitor.snapshot().state.sensor_open);

        sensor.failing.store(false, Ordering::SeqCst);
        wait_for_events(&monitor, &[EventType::SensorOpen]).await;
        assert!(monitor.snapshot().state.sensor_open);

        // Open and steady: still one event.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(logged(&monitor).await, vec![EventType::SensorOpen]);

        sensor.level.set_open(false);
        wait_for_events(&monitor, &[EventType::SensorOpen, EventType::SensorClose]).await;
        assert!(!monitor.snapshot().state.sensor_open);

        watch.shutdown().await;
        monitor.shutdown().await;
    }
}
