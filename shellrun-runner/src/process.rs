//! Running process state machine
//!
//! A [`RunningProcess`] owns one child spawned through an [`Environment`]
//! and moves through `Running -> Exited` exactly once. Status is polled,
//! never awaited: [`RunningProcess::wait`] is a sleep-and-check loop that
//! drains both pipes between checks, and [`RunningProcess::stop`] escalates
//! from `SIGTERM` to `SIGKILL` once its grace window elapses.

use crate::environment::Environment;
use chrono::{DateTime, Utc};
use shellrun_core::{
    NullObserver, ProcessObserver, ProcessSignal, ProcessState, Result, ShellError, StreamId,
};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sleep between status checks while polling
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(1_000);

/// Grace window between `SIGTERM` and `SIGKILL` in [`RunningProcess::stop`]
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_micros(1_000_000);

const READ_CHUNK_SIZE: usize = 8192;

/// Exit code reported for children terminated by a signal
const SIGNALED_EXIT_CODE: i32 = -1;

/// Options for spawning a process
#[derive(Clone)]
pub struct ProcessConfig {
    /// `None` spawns in the current directory
    pub working_directory: Option<PathBuf>,
    /// Informational; enforcement belongs to the caller's `stop` policy
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub observer: Arc<dyn ProcessObserver>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            working_directory: None,
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            observer: Arc::new(NullObserver),
        }
    }
}

/// Operations shared by every process handle, real or simulated
pub trait Process {
    fn command_line(&self) -> &str;

    fn is_running(&mut self) -> Result<bool>;

    /// Non-blocking read of output not yet returned
    fn read_output(&mut self, stream: StreamId) -> Result<Vec<u8>>;

    fn wait_with(&mut self, on_progress: &mut dyn FnMut(&[u8], &[u8])) -> Result<()>;

    fn wait(&mut self) -> Result<()> {
        self.wait_with(&mut |_, _| {})
    }

    fn stop(&mut self, timeout: Duration) -> Result<()>;

    fn send_signal(&mut self, signal: &str) -> Result<()>;

    fn exit_code(&mut self) -> Result<i32>;

    fn pid(&mut self) -> Result<u32>;
}

/// A spawned child process with pipes on stdout and stderr
pub struct RunningProcess {
    run_id: Uuid,
    command_line: String,
    working_directory: PathBuf,
    environment: Arc<dyn Environment>,
    observer: Arc<dyn ProcessObserver>,
    child: Child,
    pid: u32,
    stdout_pipe: Option<ChildStdout>,
    stderr_pipe: Option<ChildStderr>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Latched by the first status check that sees the child gone
    exit_status: Option<ExitStatus>,
    exit_reported: bool,
    timeout: Option<Duration>,
    poll_interval: Duration,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl RunningProcess {
    /// Spawn `command_line` through the environment's shell.
    ///
    /// The working directory applies to the child only; the caller's own
    /// directory is never changed.
    pub fn spawn(
        environment: Arc<dyn Environment>,
        command_line: impl Into<String>,
        config: ProcessConfig,
    ) -> Result<Self> {
        let command_line = command_line.into();
        let working_directory = match config.working_directory {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };

        let mut command = environment.shell_command(&command_line, &working_directory);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            warn!(command = %command_line, error = %e, "Failed to spawn process");
            ShellError::ProcessSpawn(format!("Failed to spawn '{}': {}", command_line, e))
        })?;
        let started_at = Utc::now();
        let started = Instant::now();

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        if let Err(e) = prepare_pipes(stdout_pipe.as_ref(), stderr_pipe.as_ref()) {
            // never hand out a half-initialized process
            let _ = child.kill();
            let _ = child.wait();
            return Err(ShellError::ProcessSpawn(format!(
                "Failed to configure pipes for '{}': {}",
                command_line, e
            )));
        }

        let run_id = Uuid::new_v4();
        let pid = child.id();
        info!(
            run_id = %run_id,
            pid,
            command = %command_line,
            cwd = %working_directory.display(),
            "Process created"
        );
        config.observer.process_created(&command_line);

        Ok(Self {
            run_id,
            command_line,
            working_directory,
            environment,
            observer: config.observer,
            child,
            pid,
            stdout_pipe,
            stderr_pipe,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_status: None,
            exit_reported: false,
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            started_at,
            started,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Everything drained from stdout so far
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    /// Everything drained from stderr so far
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Check whether the child is still alive.
    ///
    /// The first check that observes termination latches the exit status;
    /// every later call answers from the latch without asking the OS again.
    pub fn is_running(&mut self) -> Result<bool> {
        Ok(self.poll_status()?.is_none())
    }

    pub fn state(&mut self) -> Result<ProcessState> {
        if self.is_running()? {
            Ok(ProcessState::Running)
        } else {
            Ok(ProcessState::Exited)
        }
    }

    fn poll_status(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }

        let status = self.child.try_wait()?;
        if let Some(status) = status {
            debug!(run_id = %self.run_id, pid = self.pid, status = %status, "Process exit latched");
            self.exit_status = Some(status);
        }
        Ok(status)
    }

    /// Drain whatever is currently buffered on `stream` without blocking.
    ///
    /// Returns an empty buffer when nothing new is available; bytes are
    /// never delivered twice.
    pub fn read_output(&mut self, stream: StreamId) -> Result<Vec<u8>> {
        let chunk = match stream {
            StreamId::Stdout => drain_pipe(&mut self.stdout_pipe)?,
            StreamId::Stderr => drain_pipe(&mut self.stderr_pipe)?,
        };
        if chunk.is_empty() {
            return Ok(chunk);
        }

        match stream {
            StreamId::Stdout => self.stdout.extend_from_slice(&chunk),
            StreamId::Stderr => self.stderr.extend_from_slice(&chunk),
        }

        // process_exited is terminal for observers
        if !self.exit_reported {
            match stream {
                StreamId::Stdout => self.observer.stdout_read(&chunk),
                StreamId::Stderr => self.observer.stderr_read(&chunk),
            }
        }
        Ok(chunk)
    }

    /// Block until the child exits, draining output as it arrives
    pub fn wait(&mut self) -> Result<()> {
        self.wait_with(|_, _| {})
    }

    /// Like [`wait`](Self::wait), handing every new chunk of
    /// `(stdout, stderr)` to `on_progress`.
    ///
    /// After the child exits one last drain picks up output written between
    /// the final poll and the exit.
    pub fn wait_with<F>(&mut self, on_progress: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        self.poll_until(None, on_progress).map(|_| ())
    }

    /// Poll for at most `limit`; returns `true` if the child exited.
    ///
    /// Does not signal the child when the limit passes.
    pub fn wait_timeout<F>(&mut self, limit: Duration, on_progress: F) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]),
    {
        self.poll_until(Some(Instant::now() + limit), on_progress)
    }

    fn poll_until<F>(&mut self, deadline: Option<Instant>, mut on_progress: F) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]),
    {
        while self.is_running()? {
            self.drain_both(&mut on_progress)?;

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(false);
            }
            thread::sleep(self.poll_interval);
        }

        self.drain_both(&mut on_progress)?;
        self.report_exit();
        Ok(true)
    }

    fn drain_both<F>(&mut self, on_progress: &mut F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let stdout = self.read_output(StreamId::Stdout)?;
        let stderr = self.read_output(StreamId::Stderr)?;
        if !stdout.is_empty() || !stderr.is_empty() {
            on_progress(&stdout, &stderr);
        }
        Ok(())
    }

    /// Latched exit code; `-1` if the child died from a signal
    pub fn exit_code(&mut self) -> Result<i32> {
        match self.poll_status()? {
            Some(status) => Ok(exit_code_of(status)),
            None => Err(ShellError::InvalidState {
                expected: ProcessState::Exited,
                actual: ProcessState::Running,
            }),
        }
    }

    /// Signal number that terminated the child, if any
    pub fn termination_signal(&mut self) -> Result<Option<i32>> {
        match self.poll_status()? {
            Some(status) => Ok(signal_of(status)),
            None => Err(ShellError::InvalidState {
                expected: ProcessState::Exited,
                actual: ProcessState::Running,
            }),
        }
    }

    /// OS process id, available only while the child runs
    pub fn pid(&mut self) -> Result<u32> {
        if self.is_running()? {
            Ok(self.pid)
        } else {
            Err(ShellError::InvalidState {
                expected: ProcessState::Running,
                actual: ProcessState::Exited,
            })
        }
    }

    /// Send the signal named `signal` to the running child
    pub fn send_signal(&mut self, signal: &str) -> Result<()> {
        let signal = signal.parse::<ProcessSignal>()?;
        if !self.is_running()? {
            return Err(ShellError::InvalidState {
                expected: ProcessState::Running,
                actual: ProcessState::Exited,
            });
        }
        self.signal(signal)
    }

    fn signal(&mut self, signal: ProcessSignal) -> Result<()> {
        self.environment.send_signal(self.pid, signal.name())?;
        info!(run_id = %self.run_id, pid = self.pid, signal = %signal, "Signal sent");
        self.observer.signal_sent(signal);
        Ok(())
    }

    /// Terminate the child: `SIGTERM`, then `SIGKILL` if it is still alive
    /// once `timeout` has elapsed. A zero timeout kills right after the
    /// `SIGTERM`.
    ///
    /// Stopping an exited process sends nothing.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if !self.is_running()? {
            debug!(run_id = %self.run_id, "Process already exited, nothing to stop");
            self.report_exit();
            return Ok(());
        }

        let started = Instant::now();
        self.signal(ProcessSignal::Term)?;

        while self.is_running()? {
            if started.elapsed() >= timeout {
                warn!(
                    run_id = %self.run_id,
                    pid = self.pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "Process ignored SIGTERM, escalating to SIGKILL"
                );
                self.signal(ProcessSignal::Kill)?;
                self.reap_after_kill()?;
                break;
            }
            thread::sleep(self.poll_interval);
        }

        self.report_exit();
        Ok(())
    }

    // SIGKILL cannot be caught, so a blocking reap returns promptly
    fn reap_after_kill(&mut self) -> Result<()> {
        if self.exit_status.is_none() {
            let status = self.child.wait()?;
            debug!(run_id = %self.run_id, pid = self.pid, status = %status, "Process exit latched");
            self.exit_status = Some(status);
        }
        Ok(())
    }

    fn report_exit(&mut self) {
        if self.exit_reported {
            return;
        }
        if let Some(status) = self.exit_status {
            let exit_code = exit_code_of(status);
            self.exit_reported = true;
            info!(
                run_id = %self.run_id,
                exit_code,
                duration_ms = self.started.elapsed().as_millis() as u64,
                "Process exited"
            );
            self.observer.process_exited(exit_code);
        }
    }
}

impl Process for RunningProcess {
    fn command_line(&self) -> &str {
        RunningProcess::command_line(self)
    }

    fn is_running(&mut self) -> Result<bool> {
        RunningProcess::is_running(self)
    }

    fn read_output(&mut self, stream: StreamId) -> Result<Vec<u8>> {
        RunningProcess::read_output(self, stream)
    }

    fn wait_with(&mut self, on_progress: &mut dyn FnMut(&[u8], &[u8])) -> Result<()> {
        RunningProcess::wait_with(self, |out, err| on_progress(out, err))
    }

    fn stop(&mut self, timeout: Duration) -> Result<()> {
        RunningProcess::stop(self, timeout)
    }

    fn send_signal(&mut self, signal: &str) -> Result<()> {
        RunningProcess::send_signal(self, signal)
    }

    fn exit_code(&mut self) -> Result<i32> {
        RunningProcess::exit_code(self)
    }

    fn pid(&mut self) -> Result<u32> {
        RunningProcess::pid(self)
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_status = Some(status);
            }
        }
        if self.exit_status.is_none() {
            debug!(run_id = %self.run_id, pid = self.pid, "Stopping a running process on release");
            if let Err(e) = self.stop(DEFAULT_STOP_TIMEOUT) {
                warn!(run_id = %self.run_id, pid = self.pid, error = %e, "Failed to stop process, killing it");
                let _ = self.child.kill();
                if let Ok(status) = self.child.wait() {
                    self.exit_status = Some(status);
                }
            }
        }
        self.report_exit();
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SIGNALED_EXIT_CODE)
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

/// Read until the pipe would block; closes the pipe on EOF
fn drain_pipe<R: Read>(pipe: &mut Option<R>) -> io::Result<Vec<u8>> {
    let mut collected = Vec::new();
    let Some(reader) = pipe.as_mut() else {
        return Ok(collected);
    };

    let mut buf = [0u8; READ_CHUNK_SIZE];
    let mut eof = false;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    if eof {
        *pipe = None;
    }
    Ok(collected)
}

#[cfg(unix)]
fn prepare_pipes(stdout: Option<&ChildStdout>, stderr: Option<&ChildStderr>) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    if let Some(pipe) = stdout {
        set_nonblocking(pipe.as_raw_fd())?;
    }
    if let Some(pipe) = stderr {
        set_nonblocking(pipe.as_raw_fd())?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_nonblocking(fd: std::os::unix::io::RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(not(unix))]
fn prepare_pipes(_stdout: Option<&ChildStdout>, _stderr: Option<&ChildStderr>) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "non-blocking pipes are only implemented for unix",
    ))
}
