//
// baseline.rs
//
// Resolves the comparison point for score deltas from git history.
//

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::engine::{baseline_key, AnalysisEngine};
use crate::invocation::{InvocationSpec, TaskKey};
use crate::review_cache::{BaselineSource, ReviewResult};

/// Default ref to compute deltas against.
pub const DEFAULT_COMPARISON_REF: &str = "origin/main";

/// Resolves baselines through git plumbing: the comparison commit is the
/// merge base of HEAD and the configured ref, and the baseline score comes
/// from re-analyzing the file's content at that commit.
///
/// Git invocations share one serialize key so concurrent lookups never
/// interleave inside the same repository; baseline analysis runs supersede
/// per file, matching interactive reviews.
pub struct GitBaselineSource {
    engine: Arc<AnalysisEngine>,
    comparison_ref: String,
}

impl GitBaselineSource {
    pub fn new(engine: Arc<AnalysisEngine>) -> Self {
        Self::with_ref(engine, DEFAULT_COMPARISON_REF)
    }

    pub fn with_ref(engine: Arc<AnalysisEngine>, comparison_ref: impl Into<String>) -> Self {
        Self {
            engine,
            comparison_ref: comparison_ref.into(),
        }
    }

    fn git_spec(&self, dir: &Path, args: &[&str]) -> InvocationSpec {
        InvocationSpec::new("git")
            .args(args.iter().copied())
            .with_working_dir(dir)
            .with_task(TaskKey::serialize("git"))
    }

    /// Content of `path` at `commit`, or None if git cannot produce it
    /// (untracked file, shallow clone, not a repository).
    async fn content_at(&self, path: &Path, commit: &str) -> Option<String> {
        let dir = path.parent()?;
        let file_name = path.file_name()?.to_string_lossy().into_owned();
        let pathspec = format!("{commit}:./{file_name}");
        let spec = self.git_spec(dir, &["show", &pathspec]);
        match self.engine.run_binary(spec, CancellationToken::new()).await {
            Ok(result) => Some(result.stdout),
            Err(err) => {
                log::debug!(
                    "No baseline content for {} at {}: {}",
                    path.display(),
                    commit,
                    err
                );
                None
            }
        }
    }
}

#[async_trait]
impl BaselineSource for GitBaselineSource {
    async fn baseline_commit(&self, path: &Path) -> Option<String> {
        let dir = path.parent()?;
        let spec = self.git_spec(dir, &["merge-base", "HEAD", &self.comparison_ref]);
        match self.engine.run_binary(spec, CancellationToken::new()).await {
            Ok(result) => {
                let commit = result.stdout.trim().to_string();
                (!commit.is_empty()).then_some(commit)
            }
            Err(err) => {
                log::debug!("No baseline commit for {}: {}", path.display(), err);
                None
            }
        }
    }

    async fn baseline_score(&self, path: &Path, commit: &str) -> Option<f64> {
        let content = self.content_at(path, commit).await?;
        let spec = baseline_review_spec(self.engine.binary(), path, content);
        let result = match self.engine.run_binary(spec, CancellationToken::new()).await {
            Ok(result) => result,
            Err(err) => {
                if !err.is_aborted() {
                    log::debug!("Baseline analysis of {} failed: {}", path.display(), err);
                }
                return None;
            }
        };
        match serde_json::from_str::<ReviewResult>(&result.stdout) {
            Ok(review) => review.score,
            Err(e) => {
                log::warn!(
                    "Unparseable baseline review for {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

/// Like an interactive review spec but keyed separately, so scoring the
/// baseline never supersedes the live review of the same file.
fn baseline_review_spec(binary: &Path, path: &Path, content: String) -> InvocationSpec {
    let mut spec = InvocationSpec::new(binary)
        .arg("review")
        .arg("--file-name")
        .arg(path.display().to_string())
        .arg("--output-format")
        .arg("json")
        .with_stdin(content)
        .with_task(TaskKey::supersede(baseline_key(path)));
    if let Some(dir) = path.parent() {
        spec = spec.with_working_dir(dir);
    }
    spec
}
