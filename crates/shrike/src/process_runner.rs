//
// process_runner.rs
//
// Spawns one external process per invocation and captures its output.
//

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::invocation::{ExitStatus, InvocationResult, InvocationSpec};
use crate::runner::Runner;
use crate::stats::ExecutionStats;

/// Base of every runner chain: one OS process per `run_with` call.
///
/// The working directory comes from the spec (callers pin it to the target
/// file's directory so the engine discovers directory-local configuration).
/// Every completed spawn appends a timing sample to the shared signature
/// stats table.
pub struct ProcessRunner {
    stats: Arc<ExecutionStats>,
    in_flight: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::with_stats(Arc::new(ExecutionStats::new()))
    }

    pub fn with_stats(stats: Arc<ExecutionStats>) -> Self {
        Self {
            stats,
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> &Arc<ExecutionStats> {
        &self.stats
    }

    /// Race a caller-supplied deadline against the invocation. The loser's
    /// process is released via kill-on-drop.
    pub async fn run_with_timeout(
        &self,
        spec: InvocationSpec,
        cancel: CancellationToken,
        limit: Duration,
    ) -> Result<InvocationResult, RunnerError> {
        let signature = spec.signature();
        match tokio::time::timeout(limit, self.run_with(spec, cancel)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("`{}` timed out after {:?}", signature, limit);
                Err(RunnerError::Timeout(limit))
            }
        }
    }

    async fn spawn_and_wait(
        &self,
        spec: &InvocationSpec,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, RunnerError> {
        let start = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            log::warn!("Failed to spawn {}: {}", spec.display_command(), e);
            RunnerError::Spawn {
                program: spec.program.display().to_string(),
                source: e,
            }
        })?;

        if let Some(payload) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let payload = payload.clone();
                let signature = spec.signature();
                // The write runs concurrently with the wait below: a child
                // that never drains stdin blocks this write past the pipe
                // buffer, and cancellation must still be able to kill the
                // child. Killing it breaks the pipe and ends the write.
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                        log::trace!("stdin write to `{}` failed: {}", signature, e);
                    }
                });
            }
        }

        let output = tokio::select! {
            result = child.wait_with_output() => result.map_err(|e| RunnerError::Spawn {
                program: spec.program.display().to_string(),
                source: e,
            })?,
            _ = cancel.cancelled() => {
                // Dropping the wait future drops the child; kill_on_drop
                // terminates the process.
                log::debug!("Aborting `{}` on cancellation signal", spec.signature());
                return Err(RunnerError::Aborted);
            }
        };

        let elapsed = start.elapsed();
        let signature = spec.signature();
        self.stats.record(&signature, elapsed);
        log::trace!("{} finished in {:?}", spec.display_command(), elapsed);

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() && !spec.ignore_exit_code {
            log::warn!("`{}` exited with code {}", signature, code);
            return Err(RunnerError::Execution {
                signature,
                code,
                stdout,
                stderr,
            });
        }

        Ok(InvocationResult {
            stdout,
            stderr,
            exit: ExitStatus::Exited(code),
            duration: elapsed,
        })
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes an in-flight registration even if the invocation future is dropped
/// mid-await (timeout races drop the loser).
struct InFlightGuard<'a> {
    runner: &'a ProcessRunner,
    id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.runner.in_flight.lock().unwrap().remove(&self.id);
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run_with(
        &self,
        spec: InvocationSpec,
        cancel: CancellationToken,
    ) -> Result<InvocationResult, RunnerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().unwrap().insert(id, cancel.clone());
        let _guard = InFlightGuard { runner: self, id };
        self.spawn_and_wait(&spec, &cancel).await
    }

    fn cancel_all(&self) {
        let in_flight = self.in_flight.lock().unwrap();
        for (id, token) in in_flight.iter() {
            log::debug!("Cancelling in-flight process #{}", id);
            token.cancel();
        }
    }

    fn report_stats(&self) {
        self.stats.log_summary();
    }
}
