use crate::environment::{self, Environment};
use crate::process::{ProcessConfig, RunningProcess, DEFAULT_POLL_INTERVAL, DEFAULT_STOP_TIMEOUT};
use shellrun_core::{
    AggregateObserver, NullObserver, ProcessObserver, ProcessOutput, Result, ShellError,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Separator placed between a named argument and its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Separator {
    #[default]
    Space,
    Equals,
}

impl Separator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Separator::Space => " ",
            Separator::Equals => "=",
        }
    }
}

/// One element of a command's argument list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    /// `--name`, `--name 'value'` or `--name='value'`
    Named {
        name: String,
        value: Option<String>,
        separator: Separator,
    },
    /// `-f` or `-f 'value'`
    Flag { flag: String, value: Option<String> },
    /// A positional value, always quoted
    Parameter(String),
    /// Emitted verbatim; the caller is responsible for quoting
    AdHoc(String),
}

impl Argument {
    /// Render the argument for `environment`'s shell
    pub fn encode(&self, environment: &dyn Environment) -> String {
        match self {
            Argument::Named {
                name,
                value: Some(value),
                separator,
            } => format!(
                "{}{}{}",
                name,
                separator.as_str(),
                environment.escape_argument(value)
            ),
            Argument::Named { name, value: None, .. } => name.clone(),
            Argument::Flag {
                flag,
                value: Some(value),
            } => format!("{} {}", flag, environment.escape_argument(value)),
            Argument::Flag { flag, value: None } => flag.clone(),
            Argument::Parameter(value) => environment.escape_argument(value),
            Argument::AdHoc(raw) => raw.clone(),
        }
    }
}

/// Immutable builder for [`ShellCommand`]s.
///
/// Every setter leaves `self` untouched and returns a modified copy, so a
/// partially configured builder can be shared as a template.
#[derive(Clone)]
pub struct CommandBuilder {
    environment: Option<Arc<dyn Environment>>,
    binary: String,
    arguments: Vec<Argument>,
    env_variables: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
    poll_interval: Duration,
    observers: Vec<Arc<dyn ProcessObserver>>,
}

impl CommandBuilder {
    /// Builder using the environment detected for this platform at build time
    pub fn new() -> Self {
        Self {
            environment: None,
            binary: String::new(),
            arguments: Vec::new(),
            env_variables: BTreeMap::new(),
            cwd: None,
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            observers: Vec::new(),
        }
    }

    pub fn with_environment(environment: Arc<dyn Environment>) -> Self {
        Self::new().environment(environment)
    }

    pub fn environment(&self, environment: Arc<dyn Environment>) -> Self {
        let mut next = self.clone();
        next.environment = Some(environment);
        next
    }

    pub fn binary(&self, binary: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.binary = binary.into();
        next
    }

    /// Add `name`, optionally followed by a value after `separator`
    pub fn argument(
        &self,
        name: impl Into<String>,
        value: Option<&str>,
        separator: Separator,
    ) -> Self {
        self.push(Argument::Named {
            name: name.into(),
            value: value.map(str::to_string),
            separator,
        })
    }

    pub fn flag(&self, flag: impl Into<String>, value: Option<&str>) -> Self {
        self.push(Argument::Flag {
            flag: flag.into(),
            value: value.map(str::to_string),
        })
    }

    pub fn parameter(&self, value: impl Into<String>) -> Self {
        self.push(Argument::Parameter(value.into()))
    }

    pub fn ad_hoc(&self, raw: impl Into<String>) -> Self {
        self.push(Argument::AdHoc(raw.into()))
    }

    pub fn arguments<I>(&self, arguments: I) -> Self
    where
        I: IntoIterator<Item = Argument>,
    {
        let mut next = self.clone();
        next.arguments.extend(arguments);
        next
    }

    fn push(&self, argument: Argument) -> Self {
        let mut next = self.clone();
        next.arguments.push(argument);
        next
    }

    pub fn env_variable(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.env_variables.insert(name.into(), value.into());
        next
    }

    pub fn env_variables<I, K, V>(&self, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        next.env_variables
            .extend(variables.into_iter().map(|(k, v)| (k.into(), v.into())));
        next
    }

    pub fn cwd<P: AsRef<Path>>(&self, cwd: P) -> Self {
        let mut next = self.clone();
        next.cwd = Some(cwd.as_ref().to_path_buf());
        next
    }

    /// `None` means run without a time limit
    pub fn timeout(&self, timeout: Option<Duration>) -> Self {
        let mut next = self.clone();
        next.timeout = timeout;
        next
    }

    pub fn poll_interval(&self, poll_interval: Duration) -> Self {
        let mut next = self.clone();
        next.poll_interval = poll_interval;
        next
    }

    pub fn observer(&self, observer: Arc<dyn ProcessObserver>) -> Self {
        let mut next = self.clone();
        next.observers.push(observer);
        next
    }

    /// Validate the binary and freeze the configuration
    pub fn build(&self) -> Result<ShellCommand> {
        let environment = match &self.environment {
            Some(environment) => environment.clone(),
            None => environment::detect()?,
        };
        let cwd = match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir()?,
        };

        if !environment.validate_command(&self.binary, Some(cwd.as_path())) {
            warn!(binary = %self.binary, cwd = %cwd.display(), "Command validation failed");
            return Err(ShellError::CommandValidation(self.binary.clone()));
        }

        Ok(ShellCommand {
            binary: environment.expand_path(&self.binary),
            environment,
            arguments: self.arguments.clone(),
            env_variables: self.env_variables.clone(),
            cwd,
            timeout: self.timeout,
            poll_interval: self.poll_interval,
            observer: combine_observers(&self.observers),
        })
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn combine_observers(observers: &[Arc<dyn ProcessObserver>]) -> Arc<dyn ProcessObserver> {
    match observers {
        [] => Arc::new(NullObserver),
        [single] => single.clone(),
        many => Arc::new(AggregateObserver::new(many.to_vec())),
    }
}

/// A validated, ready-to-run command
#[derive(Clone)]
pub struct ShellCommand {
    environment: Arc<dyn Environment>,
    binary: String,
    arguments: Vec<Argument>,
    env_variables: BTreeMap<String, String>,
    cwd: PathBuf,
    timeout: Option<Duration>,
    poll_interval: Duration,
    observer: Arc<dyn ProcessObserver>,
}

impl ShellCommand {
    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The full line handed to the shell: env assignments, binary, arguments
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.arguments.len() + 1);
        // an expanded home path may contain spaces
        if self.binary.chars().any(char::is_whitespace) {
            parts.push(self.environment.escape_argument(&self.binary));
        } else {
            parts.push(self.binary.clone());
        }
        parts.extend(
            self.arguments
                .iter()
                .map(|argument| argument.encode(self.environment.as_ref())),
        );

        self.environment
            .apply_environment_variables(&parts.join(" "), &self.env_variables)
    }

    /// Start the command without waiting for it
    pub fn spawn(&self) -> Result<RunningProcess> {
        let config = ProcessConfig {
            working_directory: Some(self.cwd.clone()),
            timeout: self.timeout,
            poll_interval: self.poll_interval,
            observer: self.observer.clone(),
        };
        RunningProcess::spawn(self.environment.clone(), self.command_line(), config)
    }

    /// Run to completion and collect the output.
    ///
    /// With a timeout set, a child still running when it passes is stopped
    /// with the default `SIGTERM` grace window.
    pub fn run_synchronous(&self) -> Result<ProcessOutput> {
        let mut process = self.spawn()?;

        let exited = match self.timeout {
            Some(limit) => {
                let remaining = limit.saturating_sub(process.elapsed());
                process.wait_timeout(remaining, |_, _| {})?
            }
            None => {
                process.wait()?;
                true
            }
        };

        if !exited {
            info!(
                run_id = %process.run_id(),
                timeout = ?self.timeout,
                "Command timed out, stopping"
            );
            process.stop(DEFAULT_STOP_TIMEOUT)?;
            process.wait()?;
        }

        Ok(ProcessOutput {
            command_line: process.command_line().to_string(),
            working_directory: process.working_directory().to_path_buf(),
            exit_code: process.exit_code()?,
            stdout: String::from_utf8_lossy(process.stdout()).into_owned(),
            stderr: String::from_utf8_lossy(process.stderr()).into_owned(),
            started_at: process.started_at(),
            duration_ms: process.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::environment::UnixEnvironment;
    use shellrun_core::ProcessSignal;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn unix() -> Arc<dyn Environment> {
        Arc::new(UnixEnvironment::new())
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[derive(Default)]
    struct Counter {
        created: Mutex<u32>,
        exited: Mutex<Vec<i32>>,
        signals: Mutex<Vec<ProcessSignal>>,
    }

    impl ProcessObserver for Counter {
        fn process_created(&self, _command_line: &str) {
            *self.created.lock().unwrap() += 1;
        }

        fn signal_sent(&self, signal: ProcessSignal) {
            self.signals.lock().unwrap().push(signal);
        }

        fn process_exited(&self, exit_code: i32) {
            self.exited.lock().unwrap().push(exit_code);
        }
    }

    #[test]
    fn test_argument_encoding() {
        let env = UnixEnvironment::new();

        let named = Argument::Named {
            name: "--filter".to_string(),
            value: Some("a b".to_string()),
            separator: Separator::Equals,
        };
        assert_eq!(named.encode(&env), "--filter='a b'");

        let spaced = Argument::Named {
            name: "--depth".to_string(),
            value: Some("2".to_string()),
            separator: Separator::Space,
        };
        assert_eq!(spaced.encode(&env), "--depth '2'");

        let bare = Argument::Named {
            name: "--verbose".to_string(),
            value: None,
            separator: Separator::Equals,
        };
        assert_eq!(bare.encode(&env), "--verbose");

        let flag = Argument::Flag {
            flag: "-n".to_string(),
            value: Some("5".to_string()),
        };
        assert_eq!(flag.encode(&env), "-n '5'");
        assert_eq!(Argument::Parameter("it's".to_string()).encode(&env), "'it'\\''s'");
        assert_eq!(Argument::AdHoc("| wc -l".to_string()).encode(&env), "| wc -l");
    }

    #[test]
    fn test_invalid_command_is_rejected_verbatim() {
        let err = CommandBuilder::with_environment(unix())
            .binary("foobar_not_a_real_binary")
            .build()
            .err()
            .expect("validation should fail");

        assert!(matches!(err, ShellError::CommandValidation(ref c) if c == "foobar_not_a_real_binary"));
        assert_eq!(
            err.to_string(),
            "Invalid command \"foobar_not_a_real_binary\" provided"
        );
    }

    #[test]
    fn test_setters_return_independent_copies() {
        let base = CommandBuilder::with_environment(unix()).binary("echo");
        let with_arg = base.parameter("hello");
        let with_other = base.parameter("world");

        let base_line = base.build().unwrap().command_line();
        assert_eq!(base_line.trim_end(), base_line);
        assert!(!base_line.contains("hello"));
        assert!(with_arg.build().unwrap().command_line().ends_with("'hello'"));
        assert!(with_other.build().unwrap().command_line().ends_with("'world'"));
    }

    #[test]
    fn test_command_line_rendering() {
        let command = CommandBuilder::with_environment(unix())
            .binary("ls")
            .flag("-l", None)
            .argument("--color", Some("never"), Separator::Equals)
            .parameter("my dir")
            .env_variable("LC_ALL", "C")
            .env_variable("A", "1")
            .build()
            .unwrap();

        assert_eq!(
            command.command_line(),
            "A='1' LC_ALL='C' ls -l --color='never' 'my dir'"
        );
    }

    #[test]
    fn test_relative_binary_validates_against_cwd() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "test_binary", "echo 'Test command'; echo");

        let builder = CommandBuilder::with_environment(unix()).binary("./test_binary");
        assert!(builder.build().is_err());

        let output = builder.cwd(dir.path()).build().unwrap().run_synchronous().unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "Test command\n\n");
    }

    #[test]
    fn test_home_binary_is_expanded() {
        let home = TempDir::new().unwrap();
        let script = write_script(home.path(), "tool", "exit 0");
        let env = Arc::new(UnixEnvironment::new().with_home(home.path()));

        let command = CommandBuilder::with_environment(env)
            .binary("~/tool")
            .build()
            .unwrap();
        assert_eq!(command.binary(), script.to_str().unwrap());
    }

    #[test]
    fn test_binary_with_spaces_is_quoted() {
        let root = TempDir::new().unwrap();
        let home = root.path().join("my dir");
        fs::create_dir(&home).unwrap();
        let script = write_script(&home, "tool", "echo quoted");
        let env = Arc::new(UnixEnvironment::new().with_home(&home));

        let command = CommandBuilder::with_environment(env)
            .binary("~/tool")
            .parameter("x")
            .build()
            .unwrap();
        assert_eq!(
            command.command_line(),
            format!("'{}' 'x'", script.display())
        );

        let output = command.run_synchronous().unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "quoted\n");
    }

    #[test]
    fn test_environment_variables_reach_the_child() {
        let output = CommandBuilder::with_environment(unix())
            .binary("printenv")
            .parameter("GREETING")
            .env_variable("GREETING", "hello 'world'")
            .build()
            .unwrap()
            .run_synchronous()
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "hello 'world'\n");
    }

    #[test]
    fn test_run_synchronous_reports_failure() {
        let output = CommandBuilder::with_environment(unix())
            .binary("sh")
            .flag("-c", Some("echo 'Fatal Error' >&2; exit 5"))
            .build()
            .unwrap()
            .run_synchronous()
            .unwrap();

        assert_eq!(output.exit_code, 5);
        assert_eq!(output.stderr, "Fatal Error\n");
        assert!(!output.success());
    }

    #[test]
    fn test_run_synchronous_enforces_timeout() {
        let counter = Arc::new(Counter::default());
        let output = CommandBuilder::with_environment(unix())
            .binary("sleep")
            .parameter("5")
            .timeout(Some(Duration::from_millis(200)))
            .observer(counter.clone())
            .build()
            .unwrap()
            .run_synchronous()
            .unwrap();

        assert_eq!(output.exit_code, -1);
        assert!(output.duration_ms < 5_000);
        assert_eq!(counter.signals.lock().unwrap().first(), Some(&ProcessSignal::Term));
        assert_eq!(*counter.exited.lock().unwrap(), vec![-1]);
    }

    #[test]
    fn test_every_observer_receives_events() {
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());

        CommandBuilder::with_environment(unix())
            .binary("true")
            .observer(first.clone())
            .observer(second.clone())
            .build()
            .unwrap()
            .run_synchronous()
            .unwrap();

        for counter in [first, second] {
            assert_eq!(*counter.created.lock().unwrap(), 1);
            assert_eq!(*counter.exited.lock().unwrap(), vec![0]);
        }
    }
}
