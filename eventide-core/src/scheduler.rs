//! Periodic callbacks.
//!
//! Projection queues need a timer that fires "every so often" to flush work
//! that no immediate trigger picked up. Whatever hosts them (an actor
//! runtime, a plain tokio service) supplies that timer through
//! [`Scheduler`]; [`TokioScheduler`] is the stock implementation.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};

/// Future returned by a periodic callback.
pub type Tick = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback invoked on every timer tick.
pub type PeriodicCallback = Arc<dyn Fn() -> Tick + Send + Sync + 'static>;

/// Host runtime hook for registering periodic callbacks.
pub trait Scheduler: Send + Sync {
    /// Invoke `callback` every `period` until the returned handle is
    /// cancelled or dropped. The first invocation happens after one period.
    fn register_periodic(&self, period: Duration, callback: PeriodicCallback) -> TimerHandle;
}

/// Handle to a registered timer. Dropping it cancels the timer.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop the timer. Ticks already running are not interrupted.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Shortest period [`TokioScheduler`] accepts; shorter ones are raised to it.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// [`Scheduler`] backed by `tokio::time::interval`.
///
/// Ticks run on the timer task one after another: a slow callback delays the
/// next tick rather than overlapping it, and missed ticks are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn register_periodic(&self, period: Duration, callback: PeriodicCallback) -> TimerHandle {
        if period < MIN_PERIOD {
            tracing::warn!(?period, min = ?MIN_PERIOD, "timer period too short, clamping");
        }
        let period = period.max(MIN_PERIOD);
        let task: JoinHandle<()> = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                callback().await;
            }
        });
        tracing::trace!(?period, "registered periodic callback");
        let abort = task.abort_handle();
        TimerHandle::new(move || abort.abort())
    }
}
