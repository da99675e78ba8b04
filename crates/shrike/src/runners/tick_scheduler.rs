//
// runners/tick_scheduler.rs
//
// Recurring background work that drops ticks instead of stacking them.
//

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Re-invokes one fixed unit of work on a timer. If the previous tick's work
/// has not resolved when the next tick is due, that tick is skipped entirely
/// (no queueing, no stacking); the next opportunity is the following interval
/// boundary.
///
/// For low-priority periodic scans where staleness is acceptable but backlog
/// growth is not.
pub struct TickDroppingScheduler {
    interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TickDroppingScheduler {
    pub fn new(interval: Duration) -> Self {
        assert!(!interval.is_zero(), "tick interval must be positive");
        Self {
            interval,
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register the scheduler's single unit of work. The first tick fires one
    /// interval from now, then recurs until `dispose`. Registering a second
    /// unit of work is a usage error.
    pub fn register<F, Fut>(&self, mut work: F) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut worker = self.worker.lock().unwrap();
        if self.shutdown.is_cancelled() {
            anyhow::bail!("tick scheduler is disposed");
        }
        if worker.is_some() {
            anyhow::bail!("tick scheduler already has registered work");
        }

        let token = self.shutdown.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            // Ticks that come due while work is still running are dropped.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => work().await,
                }
            }
            log::trace!("Tick scheduler worker stopped");
        });
        *worker = Some(handle);
        Ok(())
    }

    /// Stop ticking. Work already in progress finishes cooperatively.
    pub fn dispose(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            drop(handle);
        }
    }
}

impl Drop for TickDroppingScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
