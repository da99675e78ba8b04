//
// reviewer.rs
//
// Orchestrates one document review end to end: cache short-circuit, engine
// invocation, output parsing, cache writeback.
//

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::document::Document;
use crate::engine::AnalysisEngine;
use crate::error::RunnerError;
use crate::review_cache::{ReviewCache, ReviewResult};
use crate::runners::TickDroppingScheduler;

pub struct Reviewer {
    engine: Arc<AnalysisEngine>,
    cache: Arc<ReviewCache>,
}

impl Reviewer {
    pub fn new(engine: Arc<AnalysisEngine>, cache: Arc<ReviewCache>) -> Self {
        Self { engine, cache }
    }

    pub fn cache(&self) -> &Arc<ReviewCache> {
        &self.cache
    }

    /// Review one document, reusing the cached result when both the document
    /// version and the config snapshot still match.
    pub async fn review(&self, doc: &Document) -> Result<Arc<ReviewResult>, RunnerError> {
        self.review_with(doc, CancellationToken::new()).await
    }

    pub async fn review_with(
        &self,
        doc: &Document,
        cancel: CancellationToken,
    ) -> Result<Arc<ReviewResult>, RunnerError> {
        if let Some(entry) = self.cache.get_exact_version(doc) {
            log::trace!("Serving cached review for {}", doc.path.display());
            return Ok(entry.review);
        }

        let spec = self.engine.review_spec(doc);
        let signature = spec.signature();
        let result = match self.engine.run_binary(spec, cancel).await {
            Ok(result) => result,
            Err(err) => {
                // An aborted run says nothing about the file; a real failure
                // means whatever is cached no longer reflects reality.
                if !err.is_aborted() {
                    self.cache.delete(&doc.path);
                }
                return Err(err);
            }
        };

        let review = match serde_json::from_str::<ReviewResult>(&result.stdout) {
            Ok(parsed) => Arc::new(parsed),
            Err(e) => {
                log::warn!(
                    "Unparseable review output for {}: {}",
                    doc.path.display(),
                    e
                );
                self.cache.delete(&doc.path);
                return Err(RunnerError::Execution {
                    signature,
                    code: result.exit.code().unwrap_or(-1),
                    stdout: result.stdout,
                    stderr: result.stderr,
                });
            }
        };

        if !self.cache.update(doc, review.clone()) {
            self.cache.add(doc, review.clone()).await;
        }
        Ok(review)
    }

    /// Document closed: kill any in-flight review and forget its results.
    pub fn abort(&self, path: &Path) {
        self.engine.cancel_review(path);
        self.cache.delete(path);
    }

    pub async fn refresh_deltas(&self) {
        self.cache.refresh_deltas().await;
    }

    pub async fn set_baseline<F>(&self, filter: F)
    where
        F: Fn(&Path) -> bool,
    {
        self.cache.set_baseline(filter).await;
    }

    /// Start a periodic background re-scan of the paths `provider` yields.
    /// Each pass runs under the bulk admission bound; a pass still running
    /// when the next tick is due causes that tick to be dropped.
    pub fn spawn_rescan<P>(self: &Arc<Self>, interval: Duration, provider: P) -> TickDroppingScheduler
    where
        P: Fn() -> Vec<PathBuf> + Send + Sync + 'static,
    {
        let scheduler = TickDroppingScheduler::new(interval);
        let reviewer = self.clone();
        scheduler
            .register(move || {
                let reviewer = reviewer.clone();
                let paths = provider();
                async move {
                    for path in paths {
                        reviewer.rescan_one(&path).await;
                    }
                }
            })
            .expect("fresh scheduler cannot have registered work");
        scheduler
    }

    async fn rescan_one(&self, path: &Path) {
        let Ok(text) = std::fs::read_to_string(path) else {
            log::trace!("Skipping unreadable {}", path.display());
            return;
        };
        // On-disk content carries no editor version; version 0 marks it.
        let doc = Document::new(path, 0, text);
        if self.has_interactive_entry(&doc) {
            return;
        }
        let spec = self.engine.bulk_review_spec(path);
        let result = match self.engine.run_binary(spec, CancellationToken::new()).await {
            Ok(result) => result,
            Err(err) => {
                if !err.is_aborted() {
                    log::debug!("Background review of {} failed: {}", path.display(), err);
                }
                return;
            }
        };
        let Ok(parsed) = serde_json::from_str::<ReviewResult>(&result.stdout) else {
            log::debug!("Unparseable background review for {}", path.display());
            return;
        };
        // An interactive review may have landed while the engine ran;
        // re-check before writing back.
        if self.has_interactive_entry(&doc) {
            return;
        }
        let review = Arc::new(parsed);
        if !self.cache.update(&doc, review.clone()) {
            self.cache.add(&doc, review).await;
        }
    }

    /// True when the live entry for this document came from an interactive
    /// review (nonzero editor version), which always outranks a disk scan.
    fn has_interactive_entry(&self, doc: &Document) -> bool {
        self.cache.get(doc).is_some_and(|entry| entry.version != 0)
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::config_snapshot::ConfigVersionTracker;
    use crate::review_cache::NoBaselines;
    use crate::stats::ExecutionStats;
    use std::os::unix::fs::PermissionsExt;

    /// Install a shell script standing in for the engine binary.
    fn fake_engine(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("code-health");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn reviewer_with(binary: &Path) -> Arc<Reviewer> {
        let engine = Arc::new(AnalysisEngine::new(binary, Arc::new(ExecutionStats::new())));
        let cache = Arc::new(ReviewCache::new(
            Arc::new(ConfigVersionTracker::new()),
            Arc::new(NoBaselines),
        ));
        Arc::new(Reviewer::new(engine, cache))
    }

    #[tokio::test]
    async fn test_review_parses_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(
            dir.path(),
            r#"echo '{"score": 8.5, "review": [{"category": "complexity"}]}'"#,
        );
        let reviewer = reviewer_with(&binary);
        let doc = Document::new(dir.path().join("a.rs"), 1, "fn main() {}");

        let review = reviewer.review(&doc).await.unwrap();
        assert_eq!(review.score, Some(8.5));
        assert_eq!(review.issues[0].category, "complexity");
        assert!(reviewer.cache().get_exact_version(&doc).is_some());
    }

    #[tokio::test]
    async fn test_cached_result_short_circuits_engine() {
        let dir = tempfile::tempdir().unwrap();
        // First call succeeds, then the script self-destructs so any second
        // spawn would fail loudly.
        let binary = fake_engine(
            dir.path(),
            r#"echo '{"score": 9.0, "review": []}'; rm -- "$0""#,
        );
        let reviewer = reviewer_with(&binary);
        let doc = Document::new(dir.path().join("a.rs"), 1, "fn main() {}");

        reviewer.review(&doc).await.unwrap();
        let again = reviewer.review(&doc).await.unwrap();
        assert_eq!(again.score, Some(9.0));
    }

    #[tokio::test]
    async fn test_edited_document_is_reanalyzed_in_place() {
        let dir = tempfile::tempdir().unwrap();
        // Score tracks how many times the engine ran.
        let counter = dir.path().join("count");
        let binary = fake_engine(
            dir.path(),
            &format!(
                r#"n=$(cat {c} 2>/dev/null || echo 0); n=$((n + 1)); echo $n > {c}; echo "{{\"score\": $n.0, \"review\": []}}""#,
                c = counter.display()
            ),
        );
        let reviewer = reviewer_with(&binary);

        let v1 = Document::new(dir.path().join("a.rs"), 1, "fn main() {}");
        assert_eq!(reviewer.review(&v1).await.unwrap().score, Some(1.0));

        let v2 = Document::new(dir.path().join("a.rs"), 2, "fn main() { }");
        assert_eq!(reviewer.review(&v2).await.unwrap().score, Some(2.0));

        // One live entry, updated in place to the new version.
        let entry = reviewer.cache().get_exact_version(&v2).unwrap();
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn test_failure_evicts_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("fail");
        let binary = fake_engine(
            dir.path(),
            &format!(
                r#"if [ -e {f} ]; then echo boom >&2; exit 1; fi; echo '{{"score": 9.0, "review": []}}'"#,
                f = flag.display()
            ),
        );
        let reviewer = reviewer_with(&binary);
        let v1 = Document::new(dir.path().join("a.rs"), 1, "fn main() {}");
        reviewer.review(&v1).await.unwrap();

        std::fs::write(&flag, "").unwrap();
        let v2 = Document::new(dir.path().join("a.rs"), 2, "fn main() { }");
        let err = reviewer.review(&v2).await.unwrap_err();
        assert!(matches!(err, RunnerError::Execution { code: 1, .. }));
        // The stale success was evicted along with the failure.
        assert!(reviewer.cache().get(&v2).is_none());
    }

    #[tokio::test]
    async fn test_unparseable_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), "echo not json");
        let reviewer = reviewer_with(&binary);
        let doc = Document::new(dir.path().join("a.rs"), 1, "fn main() {}");

        let err = reviewer.review(&doc).await.unwrap_err();
        assert!(matches!(err, RunnerError::Execution { code: 0, .. }));
        assert!(reviewer.cache().get(&doc).is_none());
    }

    #[tokio::test]
    async fn test_abort_forgets_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), r#"echo '{"score": 9.0, "review": []}'"#);
        let reviewer = reviewer_with(&binary);
        let doc = Document::new(dir.path().join("a.rs"), 1, "fn main() {}");

        reviewer.review(&doc).await.unwrap();
        reviewer.abort(&doc.path);
        assert!(reviewer.cache().get(&doc).is_none());
    }

    #[tokio::test]
    async fn test_rescan_never_clobbers_interactive_entry() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), r#"echo '{"score": 9.0, "review": []}'"#);
        let target = dir.path().join("a.rs");
        std::fs::write(&target, "fn main() {}").unwrap();

        let reviewer = reviewer_with(&binary);
        let doc = Document::new(&target, 3, "fn main() {}");
        reviewer.review(&doc).await.unwrap();

        // The engine's output changes, but the rescan must leave the
        // interactive entry untouched.
        fake_engine(dir.path(), r#"echo '{"score": 1.0, "review": []}'"#);
        reviewer.rescan_one(&target).await;

        let entry = reviewer.cache().get(&doc).unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.review.score, Some(9.0));
    }

    #[tokio::test]
    async fn test_rescan_populates_cache_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), r#"echo '{"score": 7.0, "review": []}'"#);
        let target = dir.path().join("a.rs");
        std::fs::write(&target, "fn main() {}").unwrap();

        let reviewer = reviewer_with(&binary);
        reviewer.rescan_one(&target).await;

        let doc = Document::new(&target, 0, "fn main() {}");
        assert_eq!(
            reviewer.cache().get(&doc).unwrap().review.score,
            Some(7.0)
        );
    }
}
