//
// config_snapshot.rs
//
// Version tracking for the project-local analysis rules artifact.
//
// The artifact's content is opaque to this core; only its monotonic per-edit
// version matters, because it changes the meaning of every cached result.
//

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use walkdir::WalkDir;

/// Conventional project-relative name of the analysis rules artifact.
pub const CONFIG_FILE_NAME: &str = "code-health-rules.json";

/// Ordered snapshot of the discovered config files and their versions. Two
/// snapshots are equal iff they hold the same (file, version) pairs as an
/// unordered multiset.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    entries: Vec<(String, u64)>,
}

impl ConfigSnapshot {
    pub fn new(entries: Vec<(String, u64)>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Order-independent multiset equality.
    pub fn matches(&self, other: &ConfigSnapshot) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        let mut counts: HashMap<&(String, u64), usize> = HashMap::new();
        for pair in &self.entries {
            *counts.entry(pair).or_insert(0) += 1;
        }
        for pair in &other.entries {
            match counts.get_mut(pair) {
                Some(n) if *n > 0 => *n -= 1,
                _ => return false,
            }
        }
        true
    }
}

/// Tracks a monotonic version number per discovered config artifact, with
/// interior mutability so the watcher callback and lookups share it freely.
#[derive(Debug, Default)]
pub struct ConfigVersionTracker {
    versions: RwLock<HashMap<PathBuf, u64>>,
}

impl ConfigVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed versions for config artifacts already on disk under `root`.
    pub fn discover(&self, root: &Path) -> usize {
        let mut found = 0;
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && entry.file_name() == CONFIG_FILE_NAME {
                self.versions
                    .write()
                    .unwrap()
                    .entry(entry.into_path())
                    .or_insert(1);
                found += 1;
            }
        }
        if found > 0 {
            log::debug!("Discovered {} config artifact(s) under {}", found, root.display());
        }
        found
    }

    /// Bump (or start) the version for one artifact; returns the new version.
    pub fn bump(&self, path: &Path) -> u64 {
        let mut guard = self.versions.write().unwrap();
        let version = guard.entry(path.to_path_buf()).or_insert(0);
        *version += 1;
        *version
    }

    pub fn forget(&self, path: &Path) {
        self.versions.write().unwrap().remove(path);
    }

    pub fn version(&self, path: &Path) -> Option<u64> {
        self.versions.read().unwrap().get(path).copied()
    }

    /// The live snapshot computed from current tracker state.
    pub fn snapshot(&self) -> ConfigSnapshot {
        let guard = self.versions.read().unwrap();
        let entries = guard
            .iter()
            .map(|(path, version)| (path.display().to_string(), *version))
            .collect();
        ConfigSnapshot::new(entries)
    }
}

/// Watch `root` for edits to config artifacts. Modifications bump the
/// version, removals forget it. The returned watcher must be kept alive.
pub fn watch_config(
    tracker: Arc<ConfigVersionTracker>,
    root: &Path,
) -> notify::Result<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else {
            return;
        };
        for path in &event.paths {
            if path.file_name().map(|n| n == CONFIG_FILE_NAME) != Some(true) {
                continue;
            }
            match event.kind {
                EventKind::Remove(_) => {
                    log::debug!("Config artifact removed: {}", path.display());
                    tracker.forget(path);
                }
                EventKind::Create(_) | EventKind::Modify(_) => {
                    let version = tracker.bump(path);
                    log::trace!(
                        "Config artifact {} now at version {}",
                        path.display(),
                        version
                    );
                }
                _ => {}
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}
