//! Platform environments
//!
//! An [`Environment`] knows how the host resolves commands, how abstract
//! signal names map onto OS signals, and how arguments are quoted for the
//! shell that interprets a command line. One implementation exists per
//! platform family; [`detect`] picks the one matching the running OS.
//!
//! ## Platform Support
//!
//! - **Unix**: [`UnixEnvironment`] (Linux, macOS and the BSDs)

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::UnixEnvironment;

use shellrun_core::{Result, ShellError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Host-specific behaviour needed to validate and run commands
pub trait Environment: fmt::Debug + Send + Sync {
    /// Resolve `command` to the executable it would run, following the
    /// shell's path-resolution rules. Relative paths resolve against
    /// `cwd_override` when given, otherwise the current directory.
    fn resolve_command(&self, command: &str, cwd_override: Option<&Path>) -> Option<PathBuf>;

    /// Whether `command` resolves to an executable file
    fn validate_command(&self, command: &str, cwd_override: Option<&Path>) -> bool {
        self.resolve_command(command, cwd_override).is_some()
    }

    /// Apply home-directory expansion to `path`; other forms are returned as-is
    fn expand_path(&self, path: &str) -> String;

    /// Deliver the signal named `signal` (e.g. `SIGTERM`, `KILL`) to `pid`
    fn send_signal(&self, pid: u32, signal: &str) -> Result<()>;

    /// Quote a single argument so the shell passes it through verbatim
    fn escape_argument(&self, arg: &str) -> String;

    /// Prefix `command` with `NAME=<escaped value>` assignments
    fn apply_environment_variables(
        &self,
        command: &str,
        variables: &BTreeMap<String, String>,
    ) -> String {
        let mut line = String::new();
        for (name, value) in variables {
            line.push_str(name);
            line.push('=');
            line.push_str(&self.escape_argument(value));
            line.push(' ');
        }
        line.push_str(command);
        line
    }

    /// Build the OS command that interprets `command_line` inside `cwd`
    fn shell_command(&self, command_line: &str, cwd: &Path) -> Command;

    /// Values of `std::env::consts::OS` this environment serves
    fn supported_os(&self) -> &'static [&'static str];
}

/// Pick the environment for the running operating system
pub fn detect() -> Result<Arc<dyn Environment>> {
    detect_for(std::env::consts::OS)
}

/// Pick the environment serving `os`
pub fn detect_for(os: &str) -> Result<Arc<dyn Environment>> {
    #[allow(unused_mut)]
    let mut candidates: Vec<Arc<dyn Environment>> = Vec::new();
    #[cfg(unix)]
    candidates.push(Arc::new(UnixEnvironment::new()));

    candidates
        .into_iter()
        .find(|env| env.supported_os().contains(&os))
        .ok_or_else(|| {
            ShellError::UnsupportedPlatform(format!(
                "Unable to find an environment for OS \"{}\"; provide one explicitly",
                os
            ))
        })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_detect_current_platform() {
        let env = detect().expect("unix hosts have an environment");
        assert!(env.supported_os().contains(&std::env::consts::OS));
    }

    #[test]
    fn test_detect_unknown_platform() {
        let err = detect_for("plan9").unwrap_err();
        assert!(matches!(err, ShellError::UnsupportedPlatform(_)));
        assert!(err.to_string().contains("plan9"));
    }

    #[test]
    fn test_environment_variables_are_prefixed_in_key_order() {
        let env = UnixEnvironment::new();
        let mut variables = BTreeMap::new();
        variables.insert("TZ".to_string(), "UTC".to_string());
        variables.insert("GREETING".to_string(), "it's here".to_string());

        let line = env.apply_environment_variables("./run.sh", &variables);
        assert_eq!(line, "GREETING='it'\\''s here' TZ='UTC' ./run.sh");
    }

    #[test]
    fn test_no_environment_variables_leaves_command_untouched() {
        let env = UnixEnvironment::new();
        assert_eq!(env.apply_environment_variables("ls", &BTreeMap::new()), "ls");
    }
}
