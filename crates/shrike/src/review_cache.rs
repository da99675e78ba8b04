//
// review_cache.rs
//
// Multi-dimensional cache of analysis results, keyed by document identity,
// document version, and the live config snapshot.
//

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config_snapshot::{ConfigSnapshot, ConfigVersionTracker};
use crate::document::Document;

/// One finding reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_line: Option<u32>,
}

/// Parsed engine output for one document review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    /// Code health score; absent for files the engine refuses to score.
    pub score: Option<f64>,
    #[serde(default, rename = "review")]
    pub issues: Vec<ReviewIssue>,
}

/// Difference between the baseline score and the current score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreDelta {
    pub baseline: f64,
    pub current: f64,
}

impl ScoreDelta {
    pub fn value(&self) -> f64 {
        self.current - self.baseline
    }
}

/// Pushed to UI observers whenever a document's delta changes or disappears
/// (`delta: None` means "this file no longer has a delta").
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent {
    pub path: PathBuf,
    pub delta: Option<ScoreDelta>,
}

/// Injected lookup for the comparison point. Implemented over git plumbing in
/// production; tests inject a fixed table.
#[async_trait]
pub trait BaselineSource: Send + Sync {
    /// Commit to compare against, if one is resolvable for this document.
    async fn baseline_commit(&self, path: &Path) -> Option<String>;

    /// Score of the document's content at the given commit.
    async fn baseline_score(&self, path: &Path, commit: &str) -> Option<f64>;
}

/// A `BaselineSource` that never resolves; deltas stay absent.
pub struct NoBaselines;

#[async_trait]
impl BaselineSource for NoBaselines {
    async fn baseline_commit(&self, _path: &Path) -> Option<String> {
        None
    }

    async fn baseline_score(&self, _path: &Path, _commit: &str) -> Option<f64> {
        None
    }
}

/// One cached analysis outcome for a (document, config snapshot) pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub version: i32,
    pub snapshot: ConfigSnapshot,
    pub review: Arc<ReviewResult>,
    pub baseline_score: Option<f64>,
    pub delta: Option<ScoreDelta>,
    /// Whether a downstream UI update has been requested for this entry.
    pub refresh_requested: bool,
}

impl CacheEntry {
    fn recompute_delta(&mut self) {
        self.delta = match (self.baseline_score, self.review.score) {
            (Some(baseline), Some(current)) => Some(ScoreDelta { baseline, current }),
            _ => None,
        };
    }
}

/// Review cache. Entries for stale config snapshots are left in place when
/// the snapshot moves on (uncollected until an explicit delete); at most one
/// entry per document matches the live snapshot at lookup time.
pub struct ReviewCache {
    entries: RwLock<HashMap<PathBuf, Vec<CacheEntry>>>,
    tracker: Arc<ConfigVersionTracker>,
    baselines: Arc<dyn BaselineSource>,
    deltas: Option<mpsc::UnboundedSender<DeltaEvent>>,
}

impl ReviewCache {
    pub fn new(tracker: Arc<ConfigVersionTracker>, baselines: Arc<dyn BaselineSource>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tracker,
            baselines,
            deltas: None,
        }
    }

    /// Attach a channel that receives a `DeltaEvent` whenever a document's
    /// delta changes or disappears.
    pub fn with_delta_observer(mut self, observer: mpsc::UnboundedSender<DeltaEvent>) -> Self {
        self.deltas = Some(observer);
        self
    }

    pub fn live_snapshot(&self) -> ConfigSnapshot {
        self.tracker.snapshot()
    }

    /// Entry whose stored snapshot matches the live one; version-blind.
    pub fn get(&self, doc: &Document) -> Option<CacheEntry> {
        let live = self.live_snapshot();
        let guard = self.entries.read().unwrap();
        guard
            .get(&doc.path)?
            .iter()
            .find(|entry| entry.snapshot.matches(&live))
            .cloned()
    }

    /// As `get`, additionally requiring the stored document version to equal
    /// the document's current version. Short-circuits redundant re-analysis.
    pub fn get_exact_version(&self, doc: &Document) -> Option<CacheEntry> {
        self.get(doc).filter(|entry| entry.version == doc.version)
    }

    /// Create an entry under the live snapshot. If a baseline commit is
    /// resolvable for the document, the baseline score and delta are computed
    /// as part of the add.
    pub async fn add(&self, doc: &Document, review: Arc<ReviewResult>) {
        let snapshot = self.live_snapshot();
        let mut entry = CacheEntry {
            version: doc.version,
            snapshot: snapshot.clone(),
            review,
            baseline_score: None,
            delta: None,
            refresh_requested: false,
        };
        if let Some(commit) = self.baselines.baseline_commit(&doc.path).await {
            entry.baseline_score = self.baselines.baseline_score(&doc.path, &commit).await;
            entry.recompute_delta();
        }
        let delta = entry.delta;
        {
            let mut guard = self.entries.write().unwrap();
            let variants = guard.entry(doc.path.clone()).or_default();
            // One entry per snapshot; stale-snapshot variants stay.
            variants.retain(|existing| !existing.snapshot.matches(&snapshot));
            variants.push(entry);
        }
        self.emit(&doc.path, delta);
    }

    /// Replace the result and version of the entry matching the live
    /// snapshot, in place. Returns false when no such entry exists (the
    /// caller must `add` instead).
    pub fn update(&self, doc: &Document, review: Arc<ReviewResult>) -> bool {
        let live = self.live_snapshot();
        let delta = {
            let mut guard = self.entries.write().unwrap();
            let Some(variants) = guard.get_mut(&doc.path) else {
                return false;
            };
            let Some(entry) = variants.iter_mut().find(|e| e.snapshot.matches(&live)) else {
                return false;
            };
            entry.review = review;
            entry.version = doc.version;
            entry.recompute_delta();
            entry.delta
        };
        self.emit(&doc.path, delta);
        true
    }

    /// Remove every snapshot-variant entry for the path, telling observers
    /// the file no longer has a delta.
    pub fn delete(&self, path: &Path) -> bool {
        let removed = self.entries.write().unwrap().remove(path).is_some();
        if removed {
            log::trace!("Dropped review cache entries for {}", path.display());
            self.emit(path, None);
        }
        removed
    }

    pub fn clear(&self) {
        let paths: Vec<PathBuf> = {
            let mut guard = self.entries.write().unwrap();
            guard.drain().map(|(path, _)| path).collect()
        };
        for path in &paths {
            self.emit(path, None);
        }
    }

    /// Mark the live entry for a path as needing a downstream UI update.
    pub fn request_refresh(&self, path: &Path) -> bool {
        let live = self.live_snapshot();
        let mut guard = self.entries.write().unwrap();
        let Some(entry) = guard
            .get_mut(path)
            .and_then(|variants| variants.iter_mut().find(|e| e.snapshot.matches(&live)))
        else {
            return false;
        };
        entry.refresh_requested = true;
        true
    }

    /// Re-stat every cached file: evict entries whose file is gone, recompute
    /// the delta for the rest. Used after the comparison point moves (branch
    /// checkout).
    pub async fn refresh_deltas(&self) {
        let live = self.live_snapshot();
        let paths: Vec<PathBuf> = self.entries.read().unwrap().keys().cloned().collect();
        for path in paths {
            if std::fs::metadata(&path).is_err() {
                log::trace!("{} no longer exists, evicting", path.display());
                self.delete(&path);
                continue;
            }
            self.rebaseline(&path, &live).await;
        }
    }

    /// Re-resolve the baseline and recompute the delta for every document
    /// satisfying `filter`. Used when the user's comparison point changes.
    pub async fn set_baseline<F>(&self, filter: F)
    where
        F: Fn(&Path) -> bool,
    {
        let live = self.live_snapshot();
        let paths: Vec<PathBuf> = self
            .entries
            .read()
            .unwrap()
            .keys()
            .filter(|path| filter(path))
            .cloned()
            .collect();
        for path in paths {
            self.rebaseline(&path, &live).await;
        }
    }

    async fn rebaseline(&self, path: &Path, live: &ConfigSnapshot) {
        // Resolve outside the lock; the entry may be deleted concurrently, so
        // existence is re-checked before writing back.
        let commit = self.baselines.baseline_commit(path).await;
        let score = match commit {
            Some(commit) => self.baselines.baseline_score(path, &commit).await,
            None => None,
        };
        let delta = {
            let mut guard = self.entries.write().unwrap();
            let Some(entry) = guard
                .get_mut(path)
                .and_then(|variants| variants.iter_mut().find(|e| e.snapshot.matches(live)))
            else {
                return;
            };
            entry.baseline_score = score;
            entry.recompute_delta();
            entry.delta
        };
        self.emit(path, delta);
    }

    fn emit(&self, path: &Path, delta: Option<ScoreDelta>) {
        if let Some(observer) = &self.deltas {
            let _ = observer.send(DeltaEvent {
                path: path.to_path_buf(),
                delta,
            });
        }
    }
}
