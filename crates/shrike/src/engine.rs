//
// engine.rs
//
// Facade over the external analysis engine binary: builds invocation specs,
// routes them through the runner layer matching their task class, and maps
// the engine's exit-code contract onto the typed error taxonomy.
//

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::document::Document;
use crate::error::{DomainIssue, QuotaInfo, RunnerError};
use crate::invocation::{InvocationResult, InvocationSpec, TaskClass, TaskKey};
use crate::process_runner::ProcessRunner;
use crate::runner::Runner;
use crate::runners::{ConcurrencyGate, KeyedCancellingRunner, KeyedSerializingRunner};
use crate::stats::ExecutionStats;

/// Exit code the engine uses for structured, user-addressable rejections.
pub const EXIT_DOMAIN_ERROR: i32 = 10;
/// Exit code the engine uses when analysis credits are exhausted.
pub const EXIT_QUOTA_EXCEEDED: i32 = 11;

/// Engine binary resolved from PATH when no explicit path is configured.
pub const DEFAULT_ENGINE_BINARY: &str = "code-health";

/// Owns the full runner stack and the engine invocation conventions. All
/// dependencies are injected at construction; nothing here is global.
pub struct AnalysisEngine {
    binary: PathBuf,
    process: Arc<ProcessRunner>,
    gate: Arc<ConcurrencyGate>,
    cancelling: Arc<KeyedCancellingRunner>,
    serializing: Arc<KeyedSerializingRunner>,
}

impl AnalysisEngine {
    pub fn new(binary: impl Into<PathBuf>, stats: Arc<ExecutionStats>) -> Self {
        let process = Arc::new(ProcessRunner::with_stats(stats));
        let base: Arc<dyn Runner> = process.clone();
        Self {
            binary: binary.into(),
            process,
            gate: Arc::new(ConcurrencyGate::new(base.clone())),
            cancelling: Arc::new(KeyedCancellingRunner::new(base.clone())),
            serializing: Arc::new(KeyedSerializingRunner::new(base)),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Interactive review of one open document. Content travels over stdin so
    /// unsaved edits are analyzed; the working directory is pinned to the
    /// file's directory so the engine picks up directory-local rules. A newer
    /// review of the same document supersedes this one.
    pub fn review_spec(&self, doc: &Document) -> InvocationSpec {
        let mut spec = InvocationSpec::new(&self.binary)
            .arg("review")
            .arg("--file-name")
            .arg(doc.path.display().to_string())
            .arg("--output-format")
            .arg("json")
            .with_stdin(doc.text.clone())
            .with_task(TaskKey::supersede(review_key(&doc.path)));
        if let Some(dir) = doc.containing_dir() {
            spec = spec.with_working_dir(dir);
        }
        spec
    }

    /// Background review of one on-disk file, admitted through the gate so a
    /// bulk scan cannot starve interactive reviews.
    pub fn bulk_review_spec(&self, path: &Path) -> InvocationSpec {
        let mut spec = InvocationSpec::new(&self.binary)
            .arg("review")
            .arg("--file-name")
            .arg(path.display().to_string())
            .arg("--output-format")
            .arg("json")
            .with_task(TaskKey::bulk(review_key(path)));
        if let Some(dir) = path.parent() {
            spec = spec.with_working_dir(dir);
        }
        spec
    }

    /// Abort the in-flight interactive review of one document, along with
    /// any baseline scoring run for it.
    pub fn cancel_review(&self, path: &Path) {
        self.cancelling.cancel_key(&review_key(path));
        self.cancelling.cancel_key(&baseline_key(path));
    }

    /// Execute a spec through the layer its task class selects, then apply
    /// the engine's exit-code contract to the outcome.
    pub async fn run_binary(
        &self,
        spec: InvocationSpec,
        cancel: CancellationToken,
    ) -> Result<InvocationResult, RunnerError> {
        let result = match spec.task.as_ref().map(|t| t.class) {
            Some(TaskClass::Supersede) => self.cancelling.run_with(spec, cancel).await,
            Some(TaskClass::Serialize) => self.serializing.run_with(spec, cancel).await,
            Some(TaskClass::Bulk) => self.gate.run_with(spec, cancel).await,
            None => self.process.run_with(spec, cancel).await,
        };
        result.map_err(map_exit_contract)
    }

    /// Run arbitrary non-process work under the bulk admission bound.
    pub async fn run_bulk_task<T>(&self, task: impl std::future::Future<Output = T>) -> T {
        self.gate.run_task(task).await
    }

    /// Fan a cancellation signal out to every layer.
    pub fn cancel_all(&self) {
        self.cancelling.cancel_all();
        self.serializing.cancel_all();
        self.gate.cancel_all();
        self.process.cancel_all();
    }

    pub fn report_stats(&self) {
        self.process.report_stats();
    }
}

fn review_key(path: &Path) -> String {
    format!("review:{}", path.display())
}

/// Supersede key for scoring a document's baseline content. Distinct from the
/// review key so a baseline run never supersedes the live review of the same
/// file, but still cancelled alongside it when the document closes.
pub(crate) fn baseline_key(path: &Path) -> String {
    format!("baseline:{}", path.display())
}

/// Exit codes 10 and 11 carry a structured JSON payload on stdout; everything
/// else passes through unchanged.
fn map_exit_contract(err: RunnerError) -> RunnerError {
    let RunnerError::Execution {
        signature,
        code,
        stdout,
        stderr,
    } = err
    else {
        return err;
    };
    match code {
        EXIT_DOMAIN_ERROR => match serde_json::from_str::<DomainIssue>(&stdout) {
            Ok(issue) => RunnerError::Domain(issue),
            Err(e) => {
                log::warn!("Unparseable domain-error payload from `{}`: {}", signature, e);
                RunnerError::Execution {
                    signature,
                    code,
                    stdout,
                    stderr,
                }
            }
        },
        EXIT_QUOTA_EXCEEDED => match serde_json::from_str::<QuotaInfo>(&stdout) {
            Ok(info) => RunnerError::Quota(info),
            Err(e) => {
                log::warn!("Unparseable quota payload from `{}`: {}", signature, e);
                RunnerError::Execution {
                    signature,
                    code,
                    stdout,
                    stderr,
                }
            }
        },
        _ => RunnerError::Execution {
            signature,
            code,
            stdout,
            stderr,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution(code: i32, stdout: &str) -> RunnerError {
        RunnerError::Execution {
            signature: "code-health review".into(),
            code,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_exit_ten_maps_to_domain() {
        let mapped = map_exit_contract(execution(
            EXIT_DOMAIN_ERROR,
            r#"{"message":"unsupported language","category":"input"}"#,
        ));
        match mapped {
            RunnerError::Domain(issue) => {
                assert_eq!(issue.message, "unsupported language");
                assert_eq!(issue.category.as_deref(), Some("input"));
            }
            other => panic!("expected Domain, got {other:?}"),
        }
    }

    #[test]
    fn test_exit_eleven_maps_to_quota() {
        let mapped = map_exit_contract(execution(
            EXIT_QUOTA_EXCEEDED,
            r#"{"message":"out of credits","resets_at":"2026-09-01"}"#,
        ));
        match mapped {
            RunnerError::Quota(info) => {
                assert_eq!(info.message, "out of credits");
                assert_eq!(info.resets_at.as_deref(), Some("2026-09-01"));
            }
            other => panic!("expected Quota, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_payload_stays_execution() {
        let mapped = map_exit_contract(execution(EXIT_DOMAIN_ERROR, "not json"));
        assert!(matches!(
            mapped,
            RunnerError::Execution { code, .. } if code == EXIT_DOMAIN_ERROR
        ));
    }

    #[test]
    fn test_other_exit_codes_pass_through() {
        let mapped = map_exit_contract(execution(1, ""));
        assert!(matches!(mapped, RunnerError::Execution { code: 1, .. }));
        assert!(matches!(
            map_exit_contract(RunnerError::Aborted),
            RunnerError::Aborted
        ));
    }

    #[test]
    fn test_review_spec_conventions() {
        let engine = AnalysisEngine::new("code-health", Arc::new(ExecutionStats::new()));
        let doc = Document::new("/proj/src/lib.rs", 3, "fn main() {}");
        let spec = engine.review_spec(&doc);

        assert_eq!(spec.stdin.as_deref(), Some("fn main() {}"));
        assert_eq!(spec.working_dir.as_deref(), Some(Path::new("/proj/src")));
        let task = spec.task.as_ref().unwrap();
        assert_eq!(task.class, TaskClass::Supersede);
        assert_eq!(task.name, "review:/proj/src/lib.rs");
        assert!(spec.args.contains(&"--output-format".to_string()));
    }

    #[test]
    fn test_bulk_spec_uses_gate_class() {
        let engine = AnalysisEngine::new("code-health", Arc::new(ExecutionStats::new()));
        let spec = engine.bulk_review_spec(Path::new("/proj/src/lib.rs"));
        assert_eq!(spec.task.as_ref().unwrap().class, TaskClass::Bulk);
        assert!(spec.stdin.is_none());
    }

    #[cfg(unix)]
    mod routing {
        use super::*;

        #[tokio::test]
        async fn test_run_binary_maps_domain_exit() {
            let engine = AnalysisEngine::new("/bin/sh", Arc::new(ExecutionStats::new()));
            let spec = InvocationSpec::new("/bin/sh")
                .args(["-c", r#"echo '{"message":"bad input"}'; exit 10"#]);
            let err = engine
                .run_binary(spec, CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, RunnerError::Domain(_)));
        }

        #[tokio::test]
        async fn test_cancel_review_aborts_baseline_run() {
            let engine = Arc::new(AnalysisEngine::new(
                "/bin/sh",
                Arc::new(ExecutionStats::new()),
            ));
            let target = Path::new("/proj/a.rs");
            let spec = InvocationSpec::new("/bin/sh")
                .args(["-c", "sleep 5"])
                .with_task(TaskKey::supersede(baseline_key(target)));
            let handle = {
                let engine = engine.clone();
                tokio::spawn(
                    async move { engine.run_binary(spec, CancellationToken::new()).await },
                )
            };
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;

            engine.cancel_review(target);
            assert!(matches!(handle.await.unwrap(), Err(RunnerError::Aborted)));
        }

        #[tokio::test]
        async fn test_run_binary_routes_supersede() {
            let engine = AnalysisEngine::new("/bin/sh", Arc::new(ExecutionStats::new()));
            let spec = InvocationSpec::new("/bin/sh")
                .args(["-c", "echo done"])
                .with_task(TaskKey::supersede("k"));
            let result = engine
                .run_binary(spec, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(result.stdout.trim(), "done");
        }
    }
}
