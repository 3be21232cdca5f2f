//! Simulated process for exercising [`Process`] consumers without spawning

use crate::process::{Process, DEFAULT_POLL_INTERVAL};
use shellrun_core::{ProcessOutput, ProcessSignal, ProcessState, Result, ShellError, StreamId};
use std::thread;
use std::time::{Duration, Instant};

/// A fake process that "runs" for a fixed duration, then exits with a
/// canned [`ProcessOutput`].
///
/// Signals end the run immediately; the reported exit code is always the
/// canned one.
#[derive(Debug, Clone)]
pub struct MockProcess {
    output: ProcessOutput,
    run_for: Duration,
    pid: u32,
    started: Instant,
    stopped: bool,
    stdout_read: bool,
    stderr_read: bool,
    signals: Vec<ProcessSignal>,
}

impl MockProcess {
    pub fn new(output: ProcessOutput, run_for: Duration, pid: u32) -> Self {
        Self {
            output,
            run_for,
            pid,
            started: Instant::now(),
            stopped: false,
            stdout_read: false,
            stderr_read: false,
            signals: Vec::new(),
        }
    }

    /// Signals received so far, in order
    pub fn signals(&self) -> &[ProcessSignal] {
        &self.signals
    }

    fn running(&self) -> bool {
        !self.stopped && self.started.elapsed() < self.run_for
    }

    fn take(&mut self, stream: StreamId) -> Vec<u8> {
        let (text, read) = match stream {
            StreamId::Stdout => (&self.output.stdout, &mut self.stdout_read),
            StreamId::Stderr => (&self.output.stderr, &mut self.stderr_read),
        };
        if *read {
            return Vec::new();
        }
        *read = true;
        text.as_bytes().to_vec()
    }
}

impl Process for MockProcess {
    fn command_line(&self) -> &str {
        &self.output.command_line
    }

    fn is_running(&mut self) -> Result<bool> {
        Ok(self.running())
    }

    fn read_output(&mut self, stream: StreamId) -> Result<Vec<u8>> {
        Ok(self.take(stream))
    }

    fn wait_with(&mut self, on_progress: &mut dyn FnMut(&[u8], &[u8])) -> Result<()> {
        while self.running() {
            thread::sleep(DEFAULT_POLL_INTERVAL);
        }

        let stdout = self.take(StreamId::Stdout);
        let stderr = self.take(StreamId::Stderr);
        if !stdout.is_empty() || !stderr.is_empty() {
            on_progress(&stdout, &stderr);
        }
        Ok(())
    }

    fn stop(&mut self, _timeout: Duration) -> Result<()> {
        if self.running() {
            self.signals.push(ProcessSignal::Term);
            self.stopped = true;
        }
        Ok(())
    }

    fn send_signal(&mut self, signal: &str) -> Result<()> {
        let signal = signal.parse::<ProcessSignal>()?;
        if !self.running() {
            return Err(ShellError::InvalidState {
                expected: ProcessState::Running,
                actual: ProcessState::Exited,
            });
        }
        self.signals.push(signal);
        self.stopped = true;
        Ok(())
    }

    fn exit_code(&mut self) -> Result<i32> {
        if self.running() {
            return Err(ShellError::InvalidState {
                expected: ProcessState::Exited,
                actual: ProcessState::Running,
            });
        }
        Ok(self.output.exit_code)
    }

    fn pid(&mut self) -> Result<u32> {
        if !self.running() {
            return Err(ShellError::InvalidState {
                expected: ProcessState::Running,
                actual: ProcessState::Exited,
            });
        }
        Ok(self.pid)
    }
}
