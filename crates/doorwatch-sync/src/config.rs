//! # Doorwatch Configuration
//!
//! One TOML file configures both binaries; each reads the sections it needs.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     DOORWATCH_DB_PATH=/var/lib/doorwatch/events.db                     │
//! │     DOORWATCH_SERVER_URL=http://10.0.0.5:8765                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/doorwatch/doorwatch.toml (Linux)                         │
//! │     ~/Library/Application Support/io.doorwatch.doorwatch/ (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/doorwatch/doorwatch.db"
//!
//! [sensor]
//! source = "gpio"            # gpio | simulated
//! gpio_value_path = "/sys/class/gpio/gpio17/value"
//!
//! [indicators]
//! mode = "gpio"              # gpio | log
//!
//! [escalation]
//! default_duration_secs = 30
//!
//! [hub]
//! port = 8765
//!
//! [client]
//! server_url = "http://127.0.0.1:8765"
//! failure_threshold = 3
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use doorwatch_engine::{EventLogConfig, MonitorConfig};

use crate::error::{SyncError, SyncResult};

/// Default hub port.
pub const DEFAULT_HUB_PORT: u16 = 8765;

/// Path of the push channel on the hub.
pub const PUSH_PATH: &str = "/ws/events";

// =============================================================================
// Database
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("io", "doorwatch", "doorwatch")
        .map(|dirs| dirs.data_dir().join("doorwatch.db"))
        .unwrap_or_else(|| PathBuf::from("doorwatch.db"))
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
        }
    }
}

// =============================================================================
// Sensor
// =============================================================================

/// Where sensor readings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    #[default]
    Gpio,
    Simulated,
}

impl std::str::FromStr for SensorKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpio" => Ok(SensorKind::Gpio),
            "simulated" | "sim" => Ok(SensorKind::Simulated),
            other => Err(SyncError::InvalidConfig(format!("unknown sensor source '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSettings {
    #[serde(default)]
    pub source: SensorKind,

    #[serde(default = "default_sensor_path")]
    pub gpio_value_path: PathBuf,

    /// A normally-open contact reads high when the door is open.
    #[serde(default = "default_true")]
    pub active_high: bool,

    #[serde(default = "default_sensor_poll")]
    pub poll_interval_ms: u64,
}

fn default_sensor_path() -> PathBuf {
    PathBuf::from("/sys/class/gpio/gpio17/value")
}
fn default_true() -> bool {
    true
}
fn default_sensor_poll() -> u64 {
    100
}

impl Default for SensorSettings {
    fn default() -> Self {
        SensorSettings {
            source: SensorKind::default(),
            gpio_value_path: default_sensor_path(),
            active_high: true,
            poll_interval_ms: default_sensor_poll(),
        }
    }
}

impl SensorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// =============================================================================
// Indicators
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorMode {
    Gpio,
    #[default]
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSettings {
    #[serde(default)]
    pub mode: IndicatorMode,

    /// Green: on while the monitor runs.
    #[serde(default = "default_ready_path")]
    pub ready_path: PathBuf,

    /// Red: blinks while the escalation timer runs.
    #[serde(default = "default_countdown_path")]
    pub countdown_path: PathBuf,

    /// White: latched on escalation.
    #[serde(default = "default_alarm_path")]
    pub alarm_path: PathBuf,
}

fn default_ready_path() -> PathBuf {
    PathBuf::from("/sys/class/gpio/gpio22/value")
}
fn default_countdown_path() -> PathBuf {
    PathBuf::from("/sys/class/gpio/gpio23/value")
}
fn default_alarm_path() -> PathBuf {
    PathBuf::from("/sys/class/gpio/gpio24/value")
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        IndicatorSettings {
            mode: IndicatorMode::default(),
            ready_path: default_ready_path(),
            countdown_path: default_countdown_path(),
            alarm_path: default_alarm_path(),
        }
    }
}

// =============================================================================
// Escalation and Event Log
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSettings {
    /// Used when the settings table has no usable value.
    #[serde(default = "default_duration")]
    pub default_duration_secs: f64,

    #[serde(default = "default_blink")]
    pub blink_half_period_ms: u64,
}

fn default_duration() -> f64 {
    doorwatch_core::DEFAULT_ESCALATION_SECS as f64
}
fn default_blink() -> u64 {
    500
}

impl Default for EscalationSettings {
    fn default() -> Self {
        EscalationSettings {
            default_duration_secs: default_duration(),
            blink_half_period_ms: default_blink(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogSettings {
    #[serde(default = "default_dedup_window")]
    pub dedup_window_ms: u64,

    #[serde(default = "default_catch_up_events")]
    pub catch_up_max_events: i64,

    #[serde(default)]
    pub catch_up_max_age_secs: Option<u64>,

    #[serde(default = "default_max_page")]
    pub max_page_size: u32,
}

fn default_dedup_window() -> u64 {
    100
}
fn default_catch_up_events() -> i64 {
    500
}
fn default_max_page() -> u32 {
    200
}

impl Default for EventLogSettings {
    fn default() -> Self {
        EventLogSettings {
            dedup_window_ms: default_dedup_window(),
            catch_up_max_events: default_catch_up_events(),
            catch_up_max_age_secs: None,
            max_page_size: default_max_page(),
        }
    }
}

// =============================================================================
// Hub
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// Broadcast buffer per subscriber before it starts lagging.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_hub_port() -> u16 {
    DEFAULT_HUB_PORT
}
fn default_channel_capacity() -> usize {
    256
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            bind_addr: default_bind_addr(),
            port: default_hub_port(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl HubSettings {
    /// Returns `bind_addr:port`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Client
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Base URL of the hub's HTTP reads.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Push channel URL; derived from `server_url` when unset.
    #[serde(default)]
    pub push_url: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_statistics_interval")]
    pub statistics_interval_ms: u64,

    /// Consecutive poll failures before giving up.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recent_ids")]
    pub recent_ids_capacity: usize,

    #[serde(default = "default_dedup_window")]
    pub dedup_window_ms: u64,

    #[serde(default = "default_catch_up_page")]
    pub catch_up_page: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Fixed display offset for timestamps (IST by default).
    #[serde(default = "default_display_offset")]
    pub display_utc_offset_minutes: i32,
}

fn default_server_url() -> String {
    format!("http://127.0.0.1:{DEFAULT_HUB_PORT}")
}
fn default_connect_timeout() -> u64 {
    5_000
}
fn default_poll_interval() -> u64 {
    2_000
}
fn default_statistics_interval() -> u64 {
    10_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_recent_ids() -> usize {
    100
}
fn default_catch_up_page() -> u32 {
    100
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    30
}
fn default_display_offset() -> i32 {
    330
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            server_url: default_server_url(),
            push_url: None,
            connect_timeout_ms: default_connect_timeout(),
            poll_interval_ms: default_poll_interval(),
            statistics_interval_ms: default_statistics_interval(),
            failure_threshold: default_failure_threshold(),
            recent_ids_capacity: default_recent_ids(),
            dedup_window_ms: default_dedup_window(),
            catch_up_page: default_catch_up_page(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            display_utc_offset_minutes: default_display_offset(),
        }
    }
}

impl ClientSettings {
    /// Settings pointing at a hub's base URL, everything else default.
    pub fn for_server(server_url: impl Into<String>) -> Self {
        ClientSettings {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    pub fn server_url(&self) -> SyncResult<Url> {
        let url = Url::parse(&self.server_url)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(SyncError::InvalidUrl(format!(
                "server URL must be http:// or https://, got {other}://"
            ))),
        }
    }

    /// The configured push URL, or `server_url` with a ws scheme and
    /// [`PUSH_PATH`].
    pub fn push_url(&self) -> SyncResult<Url> {
        if let Some(raw) = &self.push_url {
            let url = Url::parse(raw)?;
            return match url.scheme() {
                "ws" | "wss" => Ok(url),
                other => Err(SyncError::InvalidUrl(format!(
                    "push URL must be ws:// or wss://, got {other}://"
                ))),
            };
        }

        let mut url = self.server_url()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::InvalidUrl(format!("cannot derive push URL from {url}")))?;
        url.set_path(PUSH_PATH);
        url.set_query(None);
        Ok(url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn statistics_interval(&self) -> Duration {
        Duration::from_millis(self.statistics_interval_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Checks everything the agent relies on.
    pub fn validate(&self) -> SyncResult<()> {
        self.server_url()?;
        self.push_url()?;

        let nonzero = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("statistics_interval_ms", self.statistics_interval_ms),
            ("dedup_window_ms", self.dedup_window_ms),
            ("initial_backoff_ms", self.initial_backoff_ms),
            ("max_backoff_secs", self.max_backoff_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!("client.{name} must be greater than 0")));
            }
        }
        if self.failure_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "client.failure_threshold must be greater than 0".into(),
            ));
        }
        if self.recent_ids_capacity < 2 {
            return Err(SyncError::InvalidConfig(
                "client.recent_ids_capacity must be at least 2".into(),
            ));
        }
        if self.catch_up_page == 0 {
            return Err(SyncError::InvalidConfig(
                "client.catch_up_page must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete configuration for the daemon and the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DoorwatchConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub sensor: SensorSettings,

    #[serde(default)]
    pub indicators: IndicatorSettings,

    #[serde(default)]
    pub escalation: EscalationSettings,

    #[serde(default)]
    pub event_log: EventLogSettings,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub client: ClientSettings,
}

impl DoorwatchConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (doorwatch.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.sensor.poll_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "sensor.poll_interval_ms must be greater than 0".into(),
            ));
        }

        let secs = self.escalation.default_duration_secs;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(SyncError::InvalidConfig(format!(
                "escalation.default_duration_secs must be positive, got {secs}"
            )));
        }
        if self.escalation.blink_half_period_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "escalation.blink_half_period_ms must be greater than 0".into(),
            ));
        }

        if self.event_log.catch_up_max_events <= 0 || self.event_log.max_page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "event_log.catch_up_max_events and max_page_size must be greater than 0".into(),
            ));
        }

        if self.hub.channel_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "hub.channel_capacity must be greater than 0".into(),
            ));
        }

        self.client.validate()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("DOORWATCH_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(source) = std::env::var("DOORWATCH_SENSOR") {
            match source.parse() {
                Ok(kind) => self.sensor.source = kind,
                Err(_) => warn!(source = %source, "Unknown sensor source in environment"),
            }
        }

        if let Ok(addr) = std::env::var("DOORWATCH_HUB_BIND") {
            self.hub.bind_addr = addr;
        }

        if let Ok(port) = std::env::var("DOORWATCH_HUB_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding hub port from environment");
                self.hub.port = p;
            }
        }

        if let Ok(url) = std::env::var("DOORWATCH_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.client.server_url = url;
        }

        if let Ok(url) = std::env::var("DOORWATCH_PUSH_URL") {
            self.client.push_url = Some(url);
        }

        if let Ok(threshold) = std::env::var("DOORWATCH_FAILURE_THRESHOLD") {
            if let Ok(t) = threshold.parse::<u32>() {
                self.client.failure_threshold = t;
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "doorwatch", "doorwatch")
            .map(|dirs| dirs.config_dir().join("doorwatch.toml"))
    }

    // =========================================================================
    // Engine Settings
    // =========================================================================

    pub fn event_log_config(&self) -> EventLogConfig {
        EventLogConfig {
            dedup_window: Duration::from_millis(self.event_log.dedup_window_ms),
            catch_up_max_events: self.event_log.catch_up_max_events,
            catch_up_max_age: self.event_log.catch_up_max_age_secs.map(Duration::from_secs),
            max_page_size: self.event_log.max_page_size,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            default_escalation: Duration::try_from_secs_f64(self.escalation.default_duration_secs)
                .unwrap_or(Duration::from_secs(doorwatch_core::DEFAULT_ESCALATION_SECS)),
            blink_half_period: Duration::from_millis(self.escalation.blink_half_period_ms),
            event_log: self.event_log_config(),
            ..MonitorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DoorwatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sensor.poll_interval_ms, 100);
        assert_eq!(config.hub.port, DEFAULT_HUB_PORT);
        assert_eq!(config.client.failure_threshold, 3);
        assert_eq!(config.client.recent_ids_capacity, 100);
        assert_eq!(config.escalation.default_duration_secs, 30.0);
    }

    #[test]
    fn test_push_url_derivation() {
        let client = ClientSettings::for_server("http://10.0.0.5:8765");
        assert_eq!(client.push_url().unwrap().as_str(), "ws://10.0.0.5:8765/ws/events");

        let tls = ClientSettings::for_server("https://door.example.com/");
        assert_eq!(tls.push_url().unwrap().as_str(), "wss://door.example.com/ws/events");

        let explicit = ClientSettings {
            push_url: Some("ws://other:9000/custom".into()),
            ..ClientSettings::default()
        };
        assert_eq!(explicit.push_url().unwrap().as_str(), "ws://other:9000/custom");
    }

    #[test]
    fn test_config_validation() {
        let mut config = DoorwatchConfig::default();

        config.client.server_url = "ws://wrong-scheme:8765".into();
        assert!(config.validate().unwrap_err().is_config_error());

        config.client.server_url = default_server_url();
        config.client.push_url = Some("http://not-a-socket".into());
        assert!(config.validate().is_err());

        config.client.push_url = None;
        config.client.failure_threshold = 0;
        assert!(config.validate().is_err());

        config.client.failure_threshold = 3;
        config.escalation.default_duration_secs = -5.0;
        assert!(config.validate().is_err());

        config.escalation.default_duration_secs = 12.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: DoorwatchConfig = toml::from_str(
            r#"
            [sensor]
            source = "simulated"

            [client]
            server_url = "http://hub.local:9000"
            poll_interval_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.sensor.source, SensorKind::Simulated);
        assert_eq!(config.sensor.poll_interval_ms, 100);
        assert_eq!(config.client.poll_interval_ms, 500);
        assert_eq!(config.client.statistics_interval_ms, 10_000);
        assert_eq!(config.indicators.mode, IndicatorMode::Log);
    }

    #[test]
    fn test_monitor_config_conversion() {
        let mut config = DoorwatchConfig::default();
        config.escalation.default_duration_secs = 12.5;
        config.event_log.catch_up_max_age_secs = Some(600);

        let monitor = config.monitor_config();
        assert_eq!(monitor.default_escalation, Duration::from_millis(12_500));
        assert_eq!(monitor.blink_half_period, Duration::from_millis(500));
        assert_eq!(monitor.event_log.catch_up_max_age, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_toml_serialization() {
        let toml_str = toml::to_string_pretty(&DoorwatchConfig::default()).unwrap();
        assert!(toml_str.contains("[hub]"));
        assert!(toml_str.contains("[client]"));
    }
}
