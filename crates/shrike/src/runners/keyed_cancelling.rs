//
// runners/keyed_cancelling.rs
//
// Latest-wins scheduling per task key.
//

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::invocation::{InvocationResult, InvocationSpec};
use crate::runner::Runner;

struct LiveRun {
    generation: u64,
    token: CancellationToken,
}

/// For invocations sharing a key, cancels any in-flight invocation with that
/// key before starting the new one. At most one invocation per key is ever in
/// flight; the superseded caller observes `RunnerError::Aborted`.
///
/// Used for expensive, supersedable operations where only the newest result
/// matters and abandoned work should be killed rather than waste CPU.
pub struct KeyedCancellingRunner {
    inner: Arc<dyn Runner>,
    live: Mutex<HashMap<String, LiveRun>>,
    next_generation: AtomicU64,
}

impl KeyedCancellingRunner {
    pub fn new(inner: Arc<dyn Runner>) -> Self {
        Self {
            inner,
            live: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Cancel the in-flight invocation for one key, if any.
    pub fn cancel_key(&self, name: &str) {
        if let Some(run) = self.live.lock().unwrap().remove(name) {
            log::debug!("Cancelling in-flight invocation for key `{}`", name);
            run.token.cancel();
        }
    }
}

#[async_trait]
impl Runner for KeyedCancellingRunner {
    async fn run_with(
        &self,
        spec: InvocationSpec,
        cancel: CancellationToken,
    ) -> Result<InvocationResult, RunnerError> {
        let Some(key) = spec.task.as_ref().map(|t| t.name.clone()) else {
            // Keyless specs pass straight through.
            return self.inner.run_with(spec, cancel).await;
        };

        // Child of the caller's token: the caller can still cancel this run,
        // and we can cancel it when a newer submission supersedes it.
        let token = cancel.child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut live = self.live.lock().unwrap();
            let replaced = live.insert(
                key.clone(),
                LiveRun {
                    generation,
                    token: token.clone(),
                },
            );
            if let Some(old) = replaced {
                log::trace!("Superseding in-flight invocation for key `{}`", key);
                old.token.cancel();
            }
        }

        let result = self.inner.run_with(spec, token).await;

        {
            // Only the generation that registered may deregister; a newer
            // submission owns the slot by now otherwise.
            let mut live = self.live.lock().unwrap();
            if live.get(&key).map(|r| r.generation) == Some(generation) {
                live.remove(&key);
            }
        }
        result
    }

    fn cancel_all(&self) {
        let mut live = self.live.lock().unwrap();
        for (key, run) in live.drain() {
            log::debug!("Cancelling in-flight invocation for key `{}`", key);
            run.token.cancel();
        }
    }

    fn report_stats(&self) {
        self.inner.report_stats();
    }
}
