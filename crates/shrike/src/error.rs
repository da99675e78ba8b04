//
// error.rs
//
// Typed error taxonomy for runner layers and the analysis facade.
//

use serde::Deserialize;
use thiserror::Error;

/// Structured payload the engine prints on stdout for exit code 10.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DomainIssue {
    pub message: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Structured payload the engine prints on stdout for exit code 11.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuotaInfo {
    pub message: String,
    /// When the quota resets, if the engine knows.
    #[serde(default)]
    pub resets_at: Option<String>,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    /// Process could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit with no known contract attached to the code.
    #[error("`{signature}` exited with code {code}")]
    Execution {
        signature: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// The engine reported a structured, user-addressable failure (exit 10).
    #[error("analysis rejected: {}", .0.message)]
    Domain(DomainIssue),

    /// Analysis credits are exhausted (exit 11).
    #[error("analysis credits exhausted: {}", .0.message)]
    Quota(QuotaInfo),

    /// A cancellation signal fired while the process was alive. Not a real
    /// failure: callers treat this as "no result yet".
    #[error("invocation aborted")]
    Aborted,

    /// The invocation was queued but rejected by `cancel_all` before it
    /// started, so the awaiting caller does not hang.
    #[error("queued invocation rejected before it started")]
    QueueCleared,

    /// A caller-supplied deadline elapsed before the invocation finished.
    #[error("invocation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl RunnerError {
    /// True for cancellation-shaped outcomes that must not be surfaced as
    /// user-visible failures.
    pub fn is_aborted(&self) -> bool {
        matches!(self, RunnerError::Aborted | RunnerError::QueueCleared)
    }
}
