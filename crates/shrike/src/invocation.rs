//
// invocation.rs
//
// Invocation specs and results for external process execution.
//

use std::path::PathBuf;
use std::time::Duration;

/// Maximum rendered length of a command line in log output.
const DISPLAY_TRUNCATE_AT: usize = 80;

/// How invocations sharing a task key are scheduled relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    /// Latest submission wins: an in-flight invocation with the same key is
    /// cancelled before the new one starts.
    Supersede,
    /// Strict FIFO per key; nothing is dropped or cancelled implicitly.
    Serialize,
    /// Bulk background traffic, admitted through the concurrency gate.
    Bulk,
}

/// Identifies a logical stream of invocations that must not run concurrently
/// with themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKey {
    pub class: TaskClass,
    pub name: String,
}

impl TaskKey {
    pub fn supersede(name: impl Into<String>) -> Self {
        Self {
            class: TaskClass::Supersede,
            name: name.into(),
        }
    }

    pub fn serialize(name: impl Into<String>) -> Self {
        Self {
            class: TaskClass::Serialize,
            name: name.into(),
        }
    }

    pub fn bulk(name: impl Into<String>) -> Self {
        Self {
            class: TaskClass::Bulk,
            name: name.into(),
        }
    }
}

/// One external process execution, immutable once submitted.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub task: Option<TaskKey>,
    pub stdin: Option<String>,
    pub working_dir: Option<PathBuf>,
    /// When set, a non-zero exit is returned as data instead of an error.
    /// Used for binaries whose exit code is itself meaningful output.
    pub ignore_exit_code: bool,
}

impl InvocationSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            task: None,
            stdin: None,
            working_dir: None,
            ignore_exit_code: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_task(mut self, task: TaskKey) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn ignore_exit_code(mut self) -> Self {
        self.ignore_exit_code = true;
        self
    }

    /// Executable basename plus the first one or two non-flag argument
    /// tokens. Distinguishes sub-operations of the same binary (e.g.
    /// `git merge-base` vs `git show`) in stats and log output.
    pub fn signature(&self) -> String {
        let mut parts = vec![self.program_name()];
        parts.extend(
            self.args
                .iter()
                .filter(|a| !a.starts_with('-'))
                .take(2)
                .cloned(),
        );
        parts.join(" ")
    }

    /// Full command line with long argument lists truncated for readability.
    pub fn display_command(&self) -> String {
        let mut rendered = self.program_name();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        if rendered.len() > DISPLAY_TRUNCATE_AT {
            // Safe UTF-8 truncation at the last char boundary before the limit
            let truncate_at = rendered
                .char_indices()
                .take_while(|(i, _)| *i < DISPLAY_TRUNCATE_AT)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            rendered.truncate(truncate_at);
            rendered.push_str("...");
        }
        rendered
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Process exited on its own with this code.
    Exited(i32),
    /// Process was killed by a cancellation signal.
    Aborted,
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Aborted => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

/// Captured output of one accepted invocation.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitStatus,
    pub duration: Duration,
}

impl InvocationResult {
    pub fn success(&self) -> bool {
        self.exit.success()
    }
}
