//! Unix environment: shell-compatible command resolution and POSIX signals
//!
//! Commands are resolved the way a POSIX shell would resolve them:
//!
//! 1. `/abs/path` must point at an executable file
//! 2. `~/path` is expanded against `$HOME`, then checked as an absolute path
//! 3. `./path` is joined onto the working directory, then checked
//! 4. anything else is looked up in each search-path directory, first hit wins
//!
//! `~` expansion is a shell feature that `exec` does not perform, so it is
//! replicated here.

use super::Environment;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{access, AccessFlags, Pid};
use shellrun_core::{ProcessSignal, Result, ShellError};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error};

const SHELL: &str = "/bin/sh";

const SUPPORTED_OS: &[&str] = &[
    "linux",
    "macos",
    "freebsd",
    "openbsd",
    "netbsd",
    "dragonfly",
];

/// Environment for Linux, macOS and the BSDs
#[derive(Debug, Clone)]
pub struct UnixEnvironment {
    search_paths: Vec<PathBuf>,
    home_override: Option<PathBuf>,
}

impl UnixEnvironment {
    /// Environment searching the directories listed in `PATH`
    pub fn new() -> Self {
        Self::with_search_paths(Vec::<PathBuf>::new())
    }

    /// Environment searching `paths` instead of `PATH`; an empty list falls
    /// back to `PATH`
    pub fn with_search_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut search_paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        if search_paths.is_empty() {
            search_paths = std::env::var_os("PATH")
                .map(|path| std::env::split_paths(&path).collect())
                .unwrap_or_default();
        }

        Self {
            search_paths,
            home_override: None,
        }
    }

    /// Use `home` for `~/` expansion instead of `$HOME`
    pub fn with_home<P: Into<PathBuf>>(mut self, home: P) -> Self {
        self.home_override = Some(home.into());
        self
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    fn home_dir(&self) -> Option<PathBuf> {
        self.home_override
            .clone()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
    }

    fn expand_home(&self, path: &str) -> Option<PathBuf> {
        let rest = path.strip_prefix("~/")?;
        Some(self.home_dir()?.join(rest))
    }

    fn resolve_full_path(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute() && is_executable(path) {
            Some(path.to_path_buf())
        } else {
            None
        }
    }

    fn resolve_relative_path(&self, rest: &str, cwd_override: Option<&Path>) -> Option<PathBuf> {
        let cwd = match cwd_override {
            Some(cwd) if !cwd.as_os_str().is_empty() => cwd.to_path_buf(),
            _ => std::env::current_dir().ok()?,
        };
        self.resolve_full_path(&cwd.join(rest))
    }

    fn resolve_global_command(&self, command: &str) -> Option<PathBuf> {
        // relative entries would resolve against our cwd, not the child's
        let absolute: Vec<&PathBuf> = self
            .search_paths
            .iter()
            .filter(|dir| dir.is_absolute())
            .collect();
        if absolute.is_empty() {
            return None;
        }

        let joined: OsString = match std::env::join_paths(absolute) {
            Ok(joined) => joined,
            Err(e) => {
                debug!(error = %e, "Search paths cannot be joined");
                return None;
            }
        };

        which::which_in_global(command, Some(joined))
            .ok()
            .and_then(|mut candidates| candidates.next())
    }
}

impl Default for UnixEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for UnixEnvironment {
    fn resolve_command(&self, command: &str, cwd_override: Option<&Path>) -> Option<PathBuf> {
        if command.is_empty() {
            return None;
        }

        let resolved = if command.starts_with('/') {
            self.resolve_full_path(Path::new(command))
        } else if command.starts_with("~/") {
            self.expand_home(command)
                .and_then(|path| self.resolve_full_path(&path))
        } else if let Some(rest) = command.strip_prefix("./") {
            self.resolve_relative_path(rest, cwd_override)
        } else {
            self.resolve_global_command(command)
        };

        debug!(command = %command, resolved = ?resolved, "Resolved command");
        resolved
    }

    fn expand_path(&self, path: &str) -> String {
        match self.expand_home(path) {
            Some(expanded) => expanded.to_string_lossy().into_owned(),
            None => path.to_string(),
        }
    }

    fn send_signal(&self, pid: u32, signal: &str) -> Result<()> {
        let native = match signal.parse::<ProcessSignal>()? {
            ProcessSignal::Term => Signal::SIGTERM,
            ProcessSignal::Kill => Signal::SIGKILL,
        };
        let raw_pid = i32::try_from(pid)
            .map_err(|_| ShellError::Signal(format!("Process id {} is out of range", pid)))?;

        debug!(pid, signal = %native, "Sending signal");
        kill(Pid::from_raw(raw_pid), native).map_err(|e| {
            error!(pid, signal = %native, error = %e, "Failed to send signal");
            ShellError::Signal(format!("Failed to send {} to process {}: {}", native, pid, e))
        })
    }

    fn escape_argument(&self, arg: &str) -> String {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }

    fn shell_command(&self, command_line: &str, cwd: &Path) -> Command {
        let mut command = Command::new(SHELL);
        command.arg("-c").arg(command_line).current_dir(cwd);
        command
    }

    fn supported_os(&self) -> &'static [&'static str] {
        SUPPORTED_OS
    }
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}
