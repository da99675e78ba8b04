//
// runner.rs
//
// The capability shared by every process-execution layer.
//

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::invocation::{InvocationResult, InvocationSpec};

/// Capability implemented by the process runner and every decorator layer
/// above it (concurrency gate, keyed cancelling, keyed serializing).
///
/// Decorator layers own exactly one inner `Arc<dyn Runner>`; chains are
/// composed explicitly at startup and never form a cycle. A generic
/// closure-accepting entry point would make the trait object-unsafe, so
/// `run_task` lives as an inherent method on `ConcurrencyGate`, the only
/// layer that admits non-process work.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute one invocation, observing the supplied cancellation token.
    /// Cancellation is cooperative: the process is asked to terminate and the
    /// caller observes `RunnerError::Aborted`.
    async fn run_with(
        &self,
        spec: InvocationSpec,
        cancel: CancellationToken,
    ) -> Result<InvocationResult, RunnerError>;

    /// Execute one invocation with a token nothing else holds.
    async fn run(&self, spec: InvocationSpec) -> Result<InvocationResult, RunnerError> {
        self.run_with(spec, CancellationToken::new()).await
    }

    /// Send a cancellation signal to every in-flight invocation this layer
    /// tracks, logging each one.
    fn cancel_all(&self);

    /// Log accumulated timing statistics.
    fn report_stats(&self);
}
