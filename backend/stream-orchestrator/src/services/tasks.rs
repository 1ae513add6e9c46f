//! Cancelable periodic background tasks (sweep, flush).
//!
//! Wraps `tokio::time::interval` in a handle that can be canceled
//! explicitly or by drop, so timer-driven batching is controllable from
//! tests via tokio's paused clock instead of wall-clock waits.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns `tick` every `period`. The first tick fires one full period
    /// after the spawn, not immediately.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval yields immediately on the first call; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        tracing::debug!(task = name, period_secs = period.as_secs(), "periodic task started");
        Self { name, handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
        tracing::debug!(task = self.name, "periodic task canceled");
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
