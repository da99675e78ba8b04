//
// stats.rs
//
// Rolling per-command-signature timing statistics.
//

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Accumulated timing for one command signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureSample {
    pub calls: u64,
    pub total: Duration,
}

impl SignatureSample {
    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / self.calls as u32
        }
    }
}

/// Timing table keyed by command signature, shared by every runner layer that
/// wraps the same process runner. Constructed once at startup and passed down
/// explicitly; there is no global instance.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    inner: RwLock<HashMap<String, SignatureSample>>,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one timing sample for a signature.
    pub fn record(&self, signature: &str, elapsed: Duration) {
        if let Ok(mut guard) = self.inner.write() {
            let sample = guard.entry(signature.to_string()).or_default();
            sample.calls += 1;
            sample.total += elapsed;
        }
    }

    pub fn get(&self, signature: &str) -> Option<SignatureSample> {
        self.inner.read().ok()?.get(signature).copied()
    }

    /// Log call count and average duration per signature.
    pub fn log_summary(&self) {
        let Ok(guard) = self.inner.read() else {
            return;
        };
        if guard.is_empty() {
            log::info!("No invocations recorded");
            return;
        }
        let mut signatures: Vec<_> = guard.iter().collect();
        signatures.sort_by(|a, b| a.0.cmp(b.0));
        for (signature, sample) in signatures {
            log::info!(
                "`{}`: {} call(s), {:?} avg",
                signature,
                sample.calls,
                sample.mean()
            );
        }
    }
}
