//! # Escalation Timer
//!
//! A fresh timer per open episode. While it runs, the countdown indicator
//! blinks at 1 Hz; when it expires with the door still open, it asks the
//! monitor to fire the alarm.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌──────┐  spawn   ┌─────────┐   expiry, AlarmFired accepted           │
//! │   │ Idle │ ───────► │ Running │ ─────────────────────────► Escalated    │
//! │   └──────┘          └────┬────┘                                         │
//! │                          │                                              │
//! │                          │ cancel flag set, or the StateStore no longer │
//! │                          │ runs this episode's timer (close / ack), or  │
//! │                          │ AlarmFired rejected at expiry                │
//! │                          ▼                                              │
//! │                      Cancelled  (countdown forced off)                  │
//! │                                                                         │
//! │  Half-period boundaries are absolute deadlines start + k·half, so the   │
//! │  blink does not drift. Cancellation is checked at every boundary, which │
//! │  bounds cancel latency to one half-period.                              │
//! │                                                                         │
//! │  The timer only drives the countdown indicator. The alarm indicator     │
//! │  belongs to the monitor, which sets and clears it in transition order.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use doorwatch_core::{EpisodeId, StateStore};

use crate::indicator::{IndicatorPanel, Led};

/// Lifecycle of one timer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Idle,
    Running,
    Escalated,
    Cancelled,
}

impl TimerPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TimerPhase::Escalated | TimerPhase::Cancelled)
    }
}

/// Sent to the monitor at natural expiry. The reply says whether the alarm
/// transition was accepted.
#[derive(Debug)]
pub struct ExpiryRequest {
    pub episode: EpisodeId,
    pub reply: oneshot::Sender<bool>,
}

// =============================================================================
// Handle
// =============================================================================

/// Control side of a spawned timer.
#[derive(Debug)]
pub struct EscalationHandle {
    episode: EpisodeId,
    cancel: Arc<AtomicBool>,
    phase: watch::Receiver<TimerPhase>,
    task: JoinHandle<()>,
}

impl EscalationHandle {
    pub fn episode(&self) -> EpisodeId {
        self.episode
    }

    pub fn phase(&self) -> TimerPhase {
        *self.phase.borrow()
    }

    /// Requests cooperative cancellation; takes effect at the next boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Waits until the timer reaches a terminal phase.
    pub async fn finished(&mut self) -> TimerPhase {
        let waited = self.phase.wait_for(|p| p.is_terminal()).await.map(|p| *p);
        match waited {
            Ok(phase) => phase,
            Err(_) => *self.phase.borrow(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// =============================================================================
// Timer
// =============================================================================

/// One escalation countdown, bound to one episode.
pub struct EscalationTimer {
    episode: EpisodeId,
    duration: Duration,
    half_period: Duration,
    store: Arc<StateStore>,
    panel: Arc<dyn IndicatorPanel>,
    expiry_tx: mpsc::Sender<ExpiryRequest>,
    cancel: Arc<AtomicBool>,
    phase: watch::Sender<TimerPhase>,
}

impl EscalationTimer {
    /// Spawns a timer for `episode` and returns its handle.
    pub fn spawn(
        episode: EpisodeId,
        duration: Duration,
        half_period: Duration,
        store: Arc<StateStore>,
        panel: Arc<dyn IndicatorPanel>,
        expiry_tx: mpsc::Sender<ExpiryRequest>,
    ) -> EscalationHandle {
        let cancel = Arc::new(AtomicBool::new(false));
        let (phase_tx, phase_rx) = watch::channel(TimerPhase::Idle);

        let timer = EscalationTimer {
            episode,
            duration,
            half_period: half_period.max(Duration::from_millis(1)),
            store,
            panel,
            expiry_tx,
            cancel: cancel.clone(),
            phase: phase_tx,
        };
        let task = tokio::spawn(timer.run());

        EscalationHandle {
            episode,
            cancel,
            phase: phase_rx,
            task,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || !self.store.timer_running(self.episode)
    }

    async fn run(self) {
        let start = Instant::now();
        let deadline = start + self.duration;
        self.phase.send_replace(TimerPhase::Running);
        debug!(episode = self.episode, duration = ?self.duration, "Escalation timer running");

        let mut boundary: u32 = 0;
        loop {
            if self.cancelled() {
                self.finish_cancelled();
                return;
            }
            if start + self.half_period * boundary >= deadline {
                break;
            }

            self.panel.set(Led::Countdown, boundary % 2 == 0);
            let next = (start + self.half_period * (boundary + 1)).min(deadline);
            sleep_until(next).await;
            boundary += 1;
        }

        self.panel.set(Led::Countdown, false);

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ExpiryRequest {
            episode: self.episode,
            reply: reply_tx,
        };
        let accepted = match self.expiry_tx.send(request).await {
            Ok(()) => reply_rx.await.unwrap_or(false),
            Err(_) => false,
        };

        if accepted {
            // The monitor latched the alarm indicator while applying AlarmFired.
            self.phase.send_replace(TimerPhase::Escalated);
            info!(episode = self.episode, "Escalation timer expired, alarm latched");
        } else {
            self.finish_cancelled();
        }
    }

    fn finish_cancelled(&self) {
        self.panel.set(Led::Countdown, false);
        self.phase.send_replace(TimerPhase::Cancelled);
        debug!(episode = self.episode, "Escalation timer cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::MemoryPanel;
    use doorwatch_core::Transition;

    struct Rig {
        store: Arc<StateStore>,
        panel: Arc<MemoryPanel>,
        expiry_rx: mpsc::Receiver<ExpiryRequest>,
        handle: EscalationHandle,
        started: Instant,
    }

    fn open_and_spawn(duration: Duration) -> Rig {
        let store = Arc::new(StateStore::new());
        let episode = store.apply(Transition::SensorOpened).snapshot.episode;
        let panel = Arc::new(MemoryPanel::new());
        let (expiry_tx, expiry_rx) = mpsc::channel(4);
        let started = Instant::now();
        let handle = EscalationTimer::spawn(
            episode,
            duration,
            Duration::from_millis(500),
            store.clone(),
            panel.clone(),
            expiry_tx,
        );
        Rig {
            store,
            panel,
            expiry_rx,
            handle,
            started,
        }
    }

    /// Answers expiry requests the way the monitor does.
    fn answer_expiries(store: Arc<StateStore>, mut rx: mpsc::Receiver<ExpiryRequest>) {
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let applied = store.apply(Transition::AlarmFired {
                    episode: req.episode,
                });
                let _ = req.reply.send(applied.accepted);
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_escalates_at_duration() {
        let mut rig = open_and_spawn(Duration::from_secs(30));
        answer_expiries(rig.store.clone(), rig.expiry_rx);

        assert_eq!(rig.handle.finished().await, TimerPhase::Escalated);
        assert_eq!(rig.started.elapsed(), Duration::from_secs(30));
        assert!(rig.store.snapshot().state.alarm_active);
        assert!(!rig.panel.is_on(Led::Countdown));
        // Latching the alarm indicator is the monitor's job.
        assert!(rig.panel.history(Led::Alarm).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blink_is_one_hertz() {
        let mut rig = open_and_spawn(Duration::from_secs(3));
        answer_expiries(rig.store.clone(), rig.expiry_rx);
        rig.handle.finished().await;

        let blink = rig.panel.history(Led::Countdown);
        // Six half-periods while running, plus the final "off" at expiry.
        assert_eq!(blink.len(), 7);
        for (k, (at, on)) in blink.iter().take(6).enumerate() {
            assert_eq!(*at - rig.started, Duration::from_millis(500) * k as u32);
            assert_eq!(*on, k % 2 == 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_within_half_period() {
        let mut rig = open_and_spawn(Duration::from_secs(30));
        answer_expiries(rig.store.clone(), rig.expiry_rx);

        tokio::time::sleep(Duration::from_millis(10_200)).await;
        rig.store.apply(Transition::SensorClosed);
        let closed_at = Instant::now();

        assert_eq!(rig.handle.finished().await, TimerPhase::Cancelled);
        assert!(closed_at.elapsed() <= Duration::from_millis(500));
        assert!(!rig.panel.is_on(Led::Countdown));
        assert!(!rig.panel.is_on(Led::Alarm));
        assert!(!rig.store.snapshot().state.alarm_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flag_stops_timer() {
        let mut rig = open_and_spawn(Duration::from_secs(30));
        answer_expiries(rig.store.clone(), rig.expiry_rx);

        tokio::time::sleep(Duration::from_secs(2)).await;
        rig.handle.cancel();

        assert_eq!(rig.handle.finished().await, TimerPhase::Cancelled);
        assert!(rig.started.elapsed() <= Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_expiry_ends_cancelled() {
        let mut rig = open_and_spawn(Duration::from_secs(1));

        // Monitor gone: the expiry request cannot be delivered.
        drop(rig.expiry_rx);

        assert_eq!(rig.handle.finished().await, TimerPhase::Cancelled);
        assert!(!rig.panel.is_on(Led::Alarm));
    }
}
