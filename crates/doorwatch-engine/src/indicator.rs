//! # Indicator Panel
//!
//! Three indicators, driven by the monitor and the escalation timer:
//!
//! ```text
//!   Ready      green   on while the monitor runs
//!   Countdown  red     1 Hz blink while an escalation timer runs
//!   Alarm      white   latched on escalation, cleared on close
//! ```
//!
//! Backends never fail the caller: a write error is logged and dropped, since
//! indicators are presentation only.

use std::path::PathBuf;
use std::sync::Mutex;

use tokio::time::Instant;
use tracing::{debug, warn};

/// One physical indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Led {
    Ready,
    Countdown,
    Alarm,
}

impl Led {
    pub const ALL: [Led; 3] = [Led::Ready, Led::Countdown, Led::Alarm];

    fn index(self) -> usize {
        match self {
            Led::Ready => 0,
            Led::Countdown => 1,
            Led::Alarm => 2,
        }
    }
}

impl std::fmt::Display for Led {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Led::Ready => write!(f, "ready"),
            Led::Countdown => write!(f, "countdown"),
            Led::Alarm => write!(f, "alarm"),
        }
    }
}

/// Output side of the indicators.
pub trait IndicatorPanel: Send + Sync {
    fn set(&self, led: Led, on: bool);

    /// Turns the escalation indicators off, leaving Ready alone.
    fn clear_escalation(&self) {
        self.set(Led::Countdown, false);
        self.set(Led::Alarm, false);
    }
}

// =============================================================================
// Log Panel
// =============================================================================

/// Panel that only traces indicator changes.
#[derive(Debug, Default)]
pub struct LogPanel;

impl IndicatorPanel for LogPanel {
    fn set(&self, led: Led, on: bool) {
        debug!(%led, on, "Indicator");
    }
}

// =============================================================================
// GPIO Panel
// =============================================================================

/// Panel writing `1`/`0` into sysfs GPIO value files.
#[derive(Debug, Clone)]
pub struct GpioPanel {
    ready: PathBuf,
    countdown: PathBuf,
    alarm: PathBuf,
}

impl GpioPanel {
    pub fn new(ready: impl Into<PathBuf>, countdown: impl Into<PathBuf>, alarm: impl Into<PathBuf>) -> Self {
        GpioPanel {
            ready: ready.into(),
            countdown: countdown.into(),
            alarm: alarm.into(),
        }
    }

    fn path(&self, led: Led) -> &PathBuf {
        match led {
            Led::Ready => &self.ready,
            Led::Countdown => &self.countdown,
            Led::Alarm => &self.alarm,
        }
    }
}

impl IndicatorPanel for GpioPanel {
    fn set(&self, led: Led, on: bool) {
        let path = self.path(led);
        if let Err(e) = std::fs::write(path, if on { "1" } else { "0" }) {
            warn!(%led, path = %path.display(), error = %e, "Failed to drive indicator");
        }
    }
}

// =============================================================================
// Memory Panel
// =============================================================================

/// Panel that remembers every change with its instant. Used by tests and by
/// the simulated daemon to inspect blink timing.
#[derive(Debug, Default)]
pub struct MemoryPanel {
    inner: Mutex<MemoryPanelState>,
}

#[derive(Debug, Default)]
struct MemoryPanelState {
    lit: [bool; 3],
    changes: Vec<(Instant, Led, bool)>,
}

impl MemoryPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self, led: Led) -> bool {
        self.lock().lit[led.index()]
    }

    /// Every recorded write for `led`, oldest first.
    pub fn history(&self, led: Led) -> Vec<(Instant, bool)> {
        self.lock()
            .changes
            .iter()
            .filter(|(_, l, _)| *l == led)
            .map(|(at, _, on)| (*at, *on))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryPanelState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl IndicatorPanel for MemoryPanel {
    fn set(&self, led: Led, on: bool) {
        let mut state = self.lock();
        state.lit[led.index()] = on;
        state.changes.push((Instant::now(), led, on));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_panel_tracks_state() {
        let panel = MemoryPanel::new();
        panel.set(Led::Countdown, true);
        panel.set(Led::Alarm, true);
        assert!(panel.is_on(Led::Countdown));

        panel.clear_escalation();
        assert!(!panel.is_on(Led::Countdown));
        assert!(!panel.is_on(Led::Alarm));
        assert_eq!(panel.history(Led::Countdown).len(), 2);
        assert!(panel.history(Led::Ready).is_empty());
    }

    #[test]
    fn test_gpio_panel_writes_values() {
        let dir = std::env::temp_dir().join(format!("doorwatch-panel-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let panel = GpioPanel::new(dir.join("g"), dir.join("r"), dir.join("w"));

        panel.set(Led::Alarm, true);
        assert_eq!(std::fs::read_to_string(dir.join("w")).unwrap(), "1");
        panel.set(Led::Alarm, false);
        assert_eq!(std::fs::read_to_string(dir.join("w")).unwrap(), "0");

        std::fs::remove_dir_all(&dir).ok();
    }
}
