//! # Link Mode
//!
//! Transport selection for one observer, kept apart from presentation.
//! Pure: no I/O, no clocks. The agent feeds it transport outcomes and reacts
//! to the transitions it returns.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ┌────────────┐  push up   ┌──────┐                                     │
//! │  │ Connecting │ ─────────► │ Push │ ◄───────────────┐                   │
//! │  └─────┬──────┘            └──┬───┘                 │ push up           │
//! │        │ push down /          │ push down           │ (always wins)     │
//! │        │ connect timeout      ▼                     │                   │
//! │        └────────────────►  ┌──────┐ ────────────────┤                   │
//! │                            │ Poll │                 │                   │
//! │        manual retry ─────► └──┬───┘                 │                   │
//! │                               │ N consecutive poll failures             │
//! │                               ▼                     │                   │
//! │                       ┌──────────────┐              │                   │
//! │                       │ Disconnected │ ─────────────┘                   │
//! │                       └──────────────┘                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connectivity mode of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    Connecting,
    Push,
    Poll,
    /// Polling gave up; manual refresh required.
    Disconnected,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMode::Connecting => write!(f, "connecting"),
            LinkMode::Push => write!(f, "push"),
            LinkMode::Poll => write!(f, "poll"),
            LinkMode::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub from: LinkMode,
    pub to: LinkMode,
}

/// The push/poll/disconnected state machine.
#[derive(Debug, Clone)]
pub struct LinkMachine {
    mode: LinkMode,
    failures: u32,
    threshold: u32,
}

impl LinkMachine {
    /// `threshold` consecutive poll failures lead to `Disconnected`.
    pub fn new(threshold: u32) -> Self {
        LinkMachine {
            mode: LinkMode::Connecting,
            failures: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// True while catch-up polling should run.
    pub fn is_polling(&self) -> bool {
        self.mode == LinkMode::Poll
    }

    fn go(&mut self, to: LinkMode) -> Option<ModeChange> {
        let from = self.mode;
        self.mode = to;
        (from != to).then_some(ModeChange { from, to })
    }

    /// Push channel established. Preferred over everything else.
    pub fn push_up(&mut self) -> Option<ModeChange> {
        self.failures = 0;
        self.go(LinkMode::Push)
    }

    /// Push channel failed to establish or dropped.
    pub fn push_down(&mut self) -> Option<ModeChange> {
        match self.mode {
            LinkMode::Connecting | LinkMode::Push => {
                self.failures = 0;
                self.go(LinkMode::Poll)
            }
            // Reconnect attempts failing while already polling change nothing.
            LinkMode::Poll | LinkMode::Disconnected => None,
        }
    }

    pub fn poll_succeeded(&mut self) {
        self.failures = 0;
    }

    /// Counts one failed poll; returns the change to `Disconnected` once the
    /// threshold is reached.
    pub fn poll_failed(&mut self) -> Option<ModeChange> {
        if self.mode != LinkMode::Poll {
            return None;
        }
        self.failures += 1;
        if self.failures >= self.threshold {
            self.go(LinkMode::Disconnected)
        } else {
            None
        }
    }

    /// User asked to retry after giving up: resume polling from scratch.
    pub fn manual_retry(&mut self) -> Option<ModeChange> {
        if self.mode != LinkMode::Disconnected {
            return None;
        }
        self.failures = 0;
        self.go(LinkMode::Poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_connecting_and_prefers_push() {
        let mut link = LinkMachine::new(3);
        assert_eq!(link.mode(), LinkMode::Connecting);

        let change = link.push_up().unwrap();
        assert_eq!((change.from, change.to), (LinkMode::Connecting, LinkMode::Push));
        assert!(link.push_up().is_none());
    }

    #[test]
    fn test_connect_failure_falls_back_to_poll() {
        let mut link = LinkMachine::new(3);
        assert_eq!(link.push_down().unwrap().to, LinkMode::Poll);
        assert!(link.is_polling());

        // Further reconnect failures while polling are not mode changes.
        assert!(link.push_down().is_none());
        assert_eq!(link.consecutive_failures(), 0);
    }

    #[test]
    fn test_threshold_failures_disconnect() {
        let mut link = LinkMachine::new(3);
        link.push_down();

        assert!(link.poll_failed().is_none());
        assert!(link.poll_failed().is_none());
        let change = link.poll_failed().unwrap();
        assert_eq!(change.to, LinkMode::Disconnected);
        assert!(!link.is_polling());

        // No further counting once disconnected.
        assert!(link.poll_failed().is_none());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut link = LinkMachine::new(3);
        link.push_down();

        link.poll_failed();
        link.poll_failed();
        link.poll_succeeded();
        assert!(link.poll_failed().is_none());
        assert_eq!(link.mode(), LinkMode::Poll);
    }

    #[test]
    fn test_recovery_from_disconnected() {
        let mut link = LinkMachine::new(1);
        link.push_down();
        link.poll_failed();
        assert_eq!(link.mode(), LinkMode::Disconnected);

        assert_eq!(link.manual_retry().unwrap().to, LinkMode::Poll);
        assert_eq!(link.consecutive_failures(), 0);

        link.poll_failed();
        assert_eq!(link.push_up().unwrap().from, LinkMode::Disconnected);
        assert!(link.manual_retry().is_none());
    }

    #[test]
    fn test_push_drop_then_reestablish() {
        let mut link = LinkMachine::new(3);
        link.push_up();
        assert_eq!(link.push_down().unwrap().to, LinkMode::Poll);
        assert_eq!(link.push_up().unwrap().to, LinkMode::Push);
        assert!(!link.is_polling());
    }
}
