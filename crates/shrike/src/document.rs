//
// document.rs
//
// Minimal document model consumed by the execution and caching core.
//

use std::path::{Path, PathBuf};

/// A document as seen by the analysis core: identity, edit version, content.
///
/// The editor glue owns the full document lifecycle; this core only needs the
/// storage path (cache identity and working-directory pinning), the monotonic
/// version number the editor assigns per edit, and the current text to pipe
/// into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    pub version: i32,
    pub text: String,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, version: i32, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version,
            text: text.into(),
        }
    }

    /// Directory containing the document, used as the working directory for
    /// engine invocations so directory-local configuration is discovered.
    pub fn containing_dir(&self) -> Option<&Path> {
        self.path.parent()
    }
}
