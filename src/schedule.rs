// ============================================================================
// PERIODIC TIMERS
// ============================================================================
// Every loop in the crate (target scheduler, sender drain, persistence export)
// is a `PeriodicTimer` driving a `Periodic` state object. The callback is
// awaited inside the loop task, so a slow tick delays the next one instead of
// overlapping it. Stopping cancels between ticks, never mid-callback.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use compact_str::CompactString;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Whether a loop keeps ticking after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// State driven by a `PeriodicTimer`.
#[async_trait]
pub trait Periodic: Send + 'static {
    async fn on_tick(&mut self) -> LoopControl;
}

/// A restartable periodic loop over shared state.
#[derive(Debug)]
pub struct PeriodicTimer {
    label: CompactString,
    period: Duration,
    initial_delay: Duration,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn new(label: impl Into<CompactString>, period: Duration) -> Self {
        Self {
            label: label.into(),
            period,
            initial_delay: Duration::ZERO,
            cancel: None,
            handle: None,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spawn the loop. Returns `false` if it is already running.
    pub fn start<T: Periodic>(&mut self, state: Arc<TokioMutex<T>>) -> bool {
        if self.is_running() {
            return false;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let label = self.label.clone();
        let period = self.period;
        let first_tick = Instant::now() + self.initial_delay;

        let handle = tokio::spawn(async move {
            let mut tick = interval_at(first_tick, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => {
                        debug!(target: "sqlgraphite::schedule", timer = %label, "Timer cancelled");
                        break;
                    }
                    _ = tick.tick() => {
                        let control = state.lock().await.on_tick().await;
                        if control == LoopControl::Stop {
                            debug!(target: "sqlgraphite::schedule", timer = %label, "Loop stopped itself");
                            break;
                        }
                    }
                }
            }
        });

        self.cancel = Some(token);
        self.handle = Some(handle);
        debug!(target: "sqlgraphite::schedule", timer = %self.label,
            period_ms = self.period.as_millis() as u64, "Timer started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Cancel the loop and wait for an in-flight callback to finish.
    pub async fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.join().await;
    }

    /// Wait for the loop to end on its own.
    ///
    /// Cancel safe: the handle is only released once the task has finished,
    /// so a dropped `join` leaves the timer running and stoppable.
    pub async fn join(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        let result = handle.await;
        self.handle = None;
        self.cancel = None;
        if let Err(e) = result {
            warn!(target: "sqlgraphite::schedule", timer = %self.label, error = %e,
                "Timer task ended abnormally");
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Counter {
        ticks: u32,
        stop_after: Option<u32>,
    }

    #[async_trait]
    impl Periodic for Counter {
        async fn on_tick(&mut self) -> LoopControl {
            self.ticks += 1;
            // Slower than the period so overlapping ticks would show up.
            tokio::time::sleep(Duration::from_millis(250)).await;
            match self.stop_after {
                Some(limit) if self.ticks >= limit => LoopControl::Stop,
                _ => LoopControl::Continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_callbacks_do_not_overlap() {
        let state = Arc::new(TokioMutex::new(Counter::default()));
        let mut timer = PeriodicTimer::new("test", Duration::from_millis(100));
        assert!(timer.start(Arc::clone(&state)));
        assert!(!timer.start(Arc::clone(&state)));

        tokio::time::sleep(Duration::from_millis(1_010)).await;
        timer.stop().await;

        // Ticks at 0, 250, 500, 750, 1000 at most.
        let ticks = state.lock().await.ticks;
        assert!((4..=5).contains(&ticks), "ticks = {ticks}");
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_can_stop_itself_and_restart() {
        let state = Arc::new(TokioMutex::new(Counter {
            ticks: 0,
            stop_after: Some(2),
        }));
        let mut timer = PeriodicTimer::new("test", Duration::from_millis(100))
            .with_initial_delay(Duration::from_millis(50));
        timer.start(Arc::clone(&state));
        timer.join().await;
        assert_eq!(state.lock().await.ticks, 2);

        state.lock().await.stop_after = Some(3);
        assert!(timer.start(Arc::clone(&state)));
        timer.join().await;
        assert_eq!(state.lock().await.ticks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_join_keeps_loop_stoppable() {
        let state = Arc::new(TokioMutex::new(Counter::default()));
        let mut timer = PeriodicTimer::new("test", Duration::from_secs(5));
        timer.start(Arc::clone(&state));

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = timer.join() => panic!("loop ended without being stopped"),
        }
        assert!(timer.is_running());
        assert!(!timer.start(Arc::clone(&state)));

        // The first tick is still sleeping; stop must wait for it.
        let stopped_at = Instant::now();
        timer.stop().await;
        assert!(stopped_at.elapsed() >= Duration::from_millis(150));
        assert!(!timer.is_running());
        assert_eq!(state.lock().await.ticks, 1);
    }
}
