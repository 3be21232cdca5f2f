use crate::error::ShellError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Abstract signal identifiers understood by every environment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProcessSignal {
    Term,
    Kill,
}

impl ProcessSignal {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessSignal::Term => "SIGTERM",
            ProcessSignal::Kill => "SIGKILL",
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProcessSignal {
    type Err = ShellError;

    /// Accepts both the bare (`TERM`) and prefixed (`SIGTERM`) spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "TERM" => Ok(ProcessSignal::Term),
            "KILL" => Ok(ProcessSignal::Kill),
            _ => Err(ShellError::Signal(format!("Unknown signal \"{}\" provided", s))),
        }
    }
}

/// Output stream of a child process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StreamId {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Stdout => f.write_str("stdout"),
            StreamId::Stderr => f.write_str("stderr"),
        }
    }
}

/// Lifecycle state of a running process. `Exited` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => f.write_str("running"),
            ProcessState::Exited => f.write_str("exited"),
        }
    }
}

/// Result of running a command to completion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessOutput {
    pub command_line: String,
    pub working_directory: PathBuf,
    /// `-1` when the child was terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
