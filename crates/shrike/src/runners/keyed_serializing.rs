//
// runners/keyed_serializing.rs
//
// Strict FIFO scheduling per task key, with no implicit loss.
//

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::invocation::{InvocationResult, InvocationSpec};
use crate::runner::Runner;

#[derive(Default)]
struct KeyQueue {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<Result<(), RunnerError>>>,
}

/// One FIFO queue per distinct key: an invocation for a key already running
/// starts only after every earlier invocation for that key has completed,
/// success or failure. Nothing is ever dropped or cancelled implicitly, and
/// distinct keys proceed fully concurrently.
///
/// Used for streams where losing a request is unacceptable (sequential git
/// plumbing) but per-stream ordering must hold.
pub struct KeyedSerializingRunner {
    inner: Arc<dyn Runner>,
    keys: Mutex<HashMap<String, KeyQueue>>,
}

impl KeyedSerializingRunner {
    pub fn new(inner: Arc<dyn Runner>) -> Self {
        Self {
            inner,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Hand the key to the next queued waiter, or mark it idle.
    fn release(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap();
        let Some(queue) = keys.get_mut(key) else {
            return;
        };
        while let Some(waiter) = queue.waiters.pop_front() {
            if waiter.send(Ok(())).is_ok() {
                // Handed over; the key stays busy.
                return;
            }
            // Waiter went away while queued; skip it.
        }
        keys.remove(key);
    }
}

/// Releases the key even if the running invocation's future is dropped.
struct ReleaseGuard<'a> {
    runner: &'a KeyedSerializingRunner,
    key: String,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.runner.release(&self.key);
    }
}

#[async_trait]
impl Runner for KeyedSerializingRunner {
    async fn run_with(
        &self,
        spec: InvocationSpec,
        cancel: CancellationToken,
    ) -> Result<InvocationResult, RunnerError> {
        let Some(key) = spec.task.as_ref().map(|t| t.name.clone()) else {
            return self.inner.run_with(spec, cancel).await;
        };

        let turn = {
            let mut keys = self.keys.lock().unwrap();
            let queue = keys.entry(key.clone()).or_default();
            if queue.busy {
                let (tx, rx) = oneshot::channel();
                queue.waiters.push_back(tx);
                log::trace!(
                    "Queued invocation for key `{}` (queue depth {})",
                    key,
                    queue.waiters.len()
                );
                Some(rx)
            } else {
                queue.busy = true;
                None
            }
        };

        if let Some(rx) = turn {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                // The whole queue was torn down.
                Err(_) => return Err(RunnerError::QueueCleared),
            }
        }

        let _guard = ReleaseGuard { runner: self, key };
        self.inner.run_with(spec, cancel).await
    }

    fn cancel_all(&self) {
        let mut keys = self.keys.lock().unwrap();
        let mut rejected = 0usize;
        for queue in keys.values_mut() {
            for waiter in queue.waiters.drain(..) {
                let _ = waiter.send(Err(RunnerError::QueueCleared));
                rejected += 1;
            }
        }
        // The one item per key already running inside the wrapped runner is
        // deliberately left alone.
        keys.retain(|_, queue| queue.busy);
        if rejected > 0 {
            log::info!("Rejected {} queued invocation(s)", rejected);
        }
    }

    fn report_stats(&self) {
        self.inner.report_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::TaskKey;
    use crate::runners::testing::FakeRunner;
    use std::time::Duration;

    fn spec(name: &str, key: &str) -> InvocationSpec {
        InvocationSpec::new("fake")
            .arg(name)
            .with_task(TaskKey::serialize(key))
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_completes_in_submission_order() {
        let fake = Arc::new(FakeRunner::new(Duration::from_millis(20)));
        let runner = Arc::new(KeyedSerializingRunner::new(fake.clone()));

        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let runner = runner.clone();
            let s = spec(name, "git");
            handles.push(tokio::spawn(async move { runner.run(s).await }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(
            fake.events(),
            vec!["start a", "end a", "start b", "end b", "start c", "end c"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_are_concurrent() {
        let fake = Arc::new(FakeRunner::new(Duration::from_millis(50)));
        let runner = Arc::new(KeyedSerializingRunner::new(fake.clone()));

        let handles: Vec<_> = ["k1", "k2", "k3"]
            .into_iter()
            .map(|k| {
                let runner = runner.clone();
                let s = spec(k, k);
                tokio::spawn(async move { runner.run(s).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fake.max_active.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_stall_the_queue() {
        // An aborted invocation still hands the key to the next waiter.
        let fake = Arc::new(FakeRunner::new(Duration::from_millis(50)));
        let runner = Arc::new(KeyedSerializingRunner::new(fake.clone()));
        let token = CancellationToken::new();

        let first = {
            let runner = runner.clone();
            let token = token.clone();
            tokio::spawn(async move { runner.run_with(spec("a", "git"), token).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(spec("b", "git")).await })
        };
        tokio::task::yield_now().await;

        token.cancel();
        assert!(matches!(first.await.unwrap(), Err(RunnerError::Aborted)));
        assert_eq!(second.await.unwrap().unwrap().stdout, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_rejects_queued_spares_running() {
        let fake = Arc::new(FakeRunner::new(Duration::from_millis(100)));
        let runner = Arc::new(KeyedSerializingRunner::new(fake.clone()));

        let running = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(spec("a", "git")).await })
        };
        tokio::task::yield_now().await;
        let queued = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(spec("b", "git")).await })
        };
        tokio::task::yield_now().await;

        runner.cancel_all();

        assert!(matches!(
            queued.await.unwrap(),
            Err(RunnerError::QueueCleared)
        ));
        // The running invocation is unaffected.
        assert_eq!(running.await.unwrap().unwrap().stdout, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_on_other_key_loses_nothing() {
        let fake = Arc::new(FakeRunner::new(Duration::from_millis(20)));
        let runner = Arc::new(KeyedSerializingRunner::new(fake.clone()));

        // Three on one key; all must complete even after a cancel_all is
        // issued while nothing on this key is queued anymore.
        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let runner = runner.clone();
            let s = spec(name, "stream");
            handles.push(tokio::spawn(async move { runner.run(s).await }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fake.events().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_is_skipped() {
        let fake = Arc::new(FakeRunner::new(Duration::from_millis(50)));
        let runner = Arc::new(KeyedSerializingRunner::new(fake.clone()));

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(spec("a", "git")).await })
        };
        tokio::task::yield_now().await;
        let abandoned = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(spec("b", "git")).await })
        };
        tokio::task::yield_now().await;
        let third = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(spec("c", "git")).await })
        };
        tokio::task::yield_now().await;

        abandoned.abort();
        assert!(abandoned.await.is_err());

        first.await.unwrap().unwrap();
        assert_eq!(third.await.unwrap().unwrap().stdout, "c");
        // b never started.
        assert!(!fake.events().contains(&"start b".to_string()));
    }
}
