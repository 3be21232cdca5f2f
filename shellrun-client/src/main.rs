use anyhow::Context;
use clap::{Parser, Subcommand};
use shellrun_core::{ProcessObserver, TracingObserver};
use shellrun_runner::{
    environment, CommandBuilder, Environment, RunningProcess, DEFAULT_POLL_INTERVAL,
    DEFAULT_STOP_TIMEOUT,
};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "shellrun")]
#[command(about = "Run and supervise shell commands", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command, streaming its output
    Run {
        /// Working directory for the command
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Stop the command after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Grace period between SIGTERM and SIGKILL, in milliseconds
        #[arg(long, default_value_t = DEFAULT_STOP_TIMEOUT.as_millis() as u64)]
        stop_timeout_ms: u64,

        /// Poll interval in microseconds
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_micros() as u64)]
        poll_us: u64,

        /// Environment variable for the command (NAME=VALUE), repeatable
        #[arg(short, long = "env", value_parser = parse_env_assignment)]
        env: Vec<(String, String)>,

        /// Print a JSON summary instead of streaming output
        #[arg(long)]
        json: bool,

        /// Log process lifecycle events
        #[arg(short, long)]
        verbose: bool,

        /// Binary to run
        binary: String,

        /// Arguments passed to the binary
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Check whether a command resolves to an executable
    Check {
        /// Command to resolve
        command: String,

        /// Resolve relative paths against this directory
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
}

fn parse_env_assignment(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got \"{}\"", raw)),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let environment = environment::detect()?;

    match cli.command {
        Commands::Run {
            cwd,
            timeout_ms,
            stop_timeout_ms,
            poll_us,
            env,
            json,
            verbose,
            binary,
            args,
        } => {
            let mut builder = CommandBuilder::with_environment(environment)
                .binary(binary)
                .env_variables(env)
                .timeout(timeout_ms.map(Duration::from_millis))
                .poll_interval(Duration::from_micros(poll_us));
            for arg in args {
                builder = builder.parameter(arg);
            }
            if let Some(cwd) = cwd {
                builder = builder.cwd(cwd);
            }
            if verbose {
                let observer: Arc<dyn ProcessObserver> = Arc::new(TracingObserver::new(Level::INFO));
                builder = builder.observer(observer);
            }
            let command = builder.build()?;

            let exit_code = if json {
                let output = command.run_synchronous()?;
                println!("{}", serde_json::to_string_pretty(&output)?);
                output.exit_code
            } else {
                let mut running = command.spawn()?;
                stream_until_done(
                    &mut running,
                    command.timeout(),
                    Duration::from_millis(stop_timeout_ms),
                )?
            };

            process::exit(shell_exit_code(exit_code));
        }
        Commands::Check { command, cwd } => {
            check_command(environment.as_ref(), &command, cwd)?;
        }
    }

    Ok(())
}

// signal-terminated children report -1
fn shell_exit_code(exit_code: i32) -> i32 {
    if exit_code < 0 {
        1
    } else {
        exit_code.min(255)
    }
}

/// Copies child output to our own stdout/stderr.
///
/// After the first failed write (e.g. a closed pipe downstream) the rest is
/// discarded, while the child keeps being drained.
struct OutputForwarder<O: Write, E: Write> {
    stdout: O,
    stderr: E,
    broken: bool,
}

impl<O: Write, E: Write> OutputForwarder<O, E> {
    fn new(stdout: O, stderr: E) -> Self {
        Self {
            stdout,
            stderr,
            broken: false,
        }
    }

    fn forward(&mut self, out: &[u8], err: &[u8]) {
        if self.broken {
            return;
        }
        let result = self
            .stdout
            .write_all(out)
            .and_then(|_| self.stderr.write_all(err));
        if let Err(e) = result {
            warn!(error = %e, "Failed to forward command output, discarding the rest");
            self.broken = true;
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.broken {
            return Ok(());
        }
        self.stdout.flush()
    }
}

fn stream_until_done(
    running: &mut RunningProcess,
    timeout: Option<Duration>,
    stop_timeout: Duration,
) -> anyhow::Result<i32> {
    let mut forwarder = OutputForwarder::new(std::io::stdout(), std::io::stderr());
    let mut forward = |out: &[u8], err: &[u8]| forwarder.forward(out, err);

    match timeout {
        Some(limit) => {
            if !running.wait_timeout(limit, &mut forward)? {
                info!(run_id = %running.run_id(), "Timeout reached, stopping command");
                running.stop(stop_timeout).context("failed to stop command")?;
                running.wait_with(&mut forward)?;
            }
        }
        None => running.wait_with(&mut forward)?,
    }
    forwarder.flush()?;

    Ok(running.exit_code()?)
}

fn check_command(
    environment: &dyn Environment,
    command: &str,
    cwd: Option<PathBuf>,
) -> anyhow::Result<()> {
    match environment.resolve_command(command, cwd.as_deref()) {
        Some(path) => {
            println!("{}: {}", command, path.display());
            Ok(())
        }
        None => {
            eprintln!("{}: not found", command);
            process::exit(1);
        }
    }
}
