//! # doorwatch-engine: The Sensor-Side Pipeline
//!
//! Turns sensor edges into state transitions, durable events and broadcasts,
//! and runs the escalation timer that may turn an open door into an alarm.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Engine Pipeline                                 │
//! │                                                                         │
//! │  SensorWatch ──┐                                                        │
//! │  (100 ms poll) │  Transition                                            │
//! │                ▼                                                        │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 AlarmMonitor (single actor task)                │   │
//! │  │                                                                 │   │
//! │  │   1. StateStore.apply(t)        rejected? → debug!, stop        │   │
//! │  │   2. side effects               timer spawn/cancel, indicators  │   │
//! │  │   3. EventLog.append            suppressed? → stop              │   │
//! │  │   4. EventBroadcaster.publish   only for persisted events       │   │
//! │  └───────────────▲─────────────────────────────────────────────────┘   │
//! │                  │ ExpiryRequest{episode}                               │
//! │  ┌───────────────┴─────────┐                                            │
//! │  │ EscalationTimer         │  one per episode, blinks the countdown     │
//! │  │ Idle→Running→Escalated  │  indicator at 1 Hz, checks cancellation    │
//! │  │             ↘Cancelled  │  at every half-period                      │
//! │  └─────────────────────────┘                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`monitor`] - The actor and its [`MonitorHandle`]
//! - [`event_log`] - Dedup-gated append and the catch-up window
//! - [`escalation`] - Per-episode escalation timer
//! - [`sensor`] - Sensor sources and the polling watch
//! - [`indicator`] - Indicator panel backends
//! - [`notify`] - Alarm notification hook
//! - [`error`] - Engine error types

pub mod error;
pub mod escalation;
pub mod event_log;
pub mod indicator;
pub mod monitor;
pub mod notify;
pub mod sensor;

pub use error::{EngineError, EngineResult};
pub use escalation::{EscalationHandle, EscalationTimer, ExpiryRequest, TimerPhase};
pub use event_log::{AppendOutcome, CatchUpReader, EventLog, EventLogConfig, SuppressReason};
pub use indicator::{GpioPanel, IndicatorPanel, Led, LogPanel, MemoryPanel};
pub use monitor::{
    AlarmMonitor, AlarmMonitorBuilder, EventBroadcaster, MonitorConfig, MonitorHandle,
    NoOpBroadcaster, SubmitOutcome,
};
pub use notify::{AlarmNotice, AlarmNotifier, LogNotifier};
pub use sensor::{GpioSensor, SensorSource, SensorWatch, SensorWatchHandle, SimulatedSensor};
