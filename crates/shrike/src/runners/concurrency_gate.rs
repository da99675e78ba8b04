//
// runners/concurrency_gate.rs
//
// Bounded admission control with a fair FIFO wait queue.
//

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::invocation::{InvocationResult, InvocationSpec};
use crate::runner::Runner;

/// Default admission bound. Parallel engine spawns have overflowed output
/// pipe buffers; raising this requires verifying that the spawning primitive
/// drains child stdout while the process runs.
pub const DEFAULT_BOUND: usize = 1;

/// Admits at most N concurrent invocations; the rest wait in arrival order.
/// Used for bulk, low-priority traffic (background re-scans) so it cannot
/// starve interactive work running through other layers. Task keys are not
/// inspected here.
pub struct ConcurrencyGate {
    inner: Arc<dyn Runner>,
    // tokio's semaphore is fair: permits hand over in acquire order, which
    // gives the strict FIFO queue discipline.
    permits: Semaphore,
    in_flight: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

impl ConcurrencyGate {
    pub fn new(inner: Arc<dyn Runner>) -> Self {
        Self::with_bound(inner, DEFAULT_BOUND)
    }

    pub fn with_bound(inner: Arc<dyn Runner>, bound: usize) -> Self {
        assert!(bound > 0, "gate bound must be positive");
        Self {
            inner,
            permits: Semaphore::new(bound),
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run arbitrary work under the same admission control as invocations.
    pub async fn run_task<T>(&self, task: impl Future<Output = T>) -> T {
        let _permit = self.permits.acquire().await.expect("gate semaphore closed");
        task.await
    }
}

struct InFlightGuard<'a> {
    gate: &'a ConcurrencyGate,
    id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.lock().unwrap().remove(&self.id);
    }
}

#[async_trait]
impl Runner for ConcurrencyGate {
    async fn run_with(
        &self,
        spec: InvocationSpec,
        cancel: CancellationToken,
    ) -> Result<InvocationResult, RunnerError> {
        let _permit = self.permits.acquire().await.expect("gate semaphore closed");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().unwrap().insert(id, cancel.clone());
        let _guard = InFlightGuard { gate: self, id };
        // The permit is held until this returns, releasing on success and
        // failure alike.
        self.inner.run_with(spec, cancel).await
    }

    fn cancel_all(&self) {
        let in_flight = self.in_flight.lock().unwrap();
        if !in_flight.is_empty() {
            log::info!(
                "Cancelling {} in-flight gated invocation(s)",
                in_flight.len()
            );
        }
        for (id, token) in in_flight.iter() {
            log::debug!("Cancelling gated invocation #{}", id);
            token.cancel();
        }
        // Queued work keeps its place; cancelling it is the caller's job at a
        // higher layer.
    }

    fn report_stats(&self) {
        self.inner.report_stats();
    }
}
