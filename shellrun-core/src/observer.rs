//! Lifecycle observers for running processes
//!
//! Observers are invoked synchronously, in this order for a single run:
//! `process_created`, any interleaving of `stdout_read` / `stderr_read`,
//! any `signal_sent`, then exactly one `process_exited`.

use crate::models::ProcessSignal;
use std::sync::Arc;
use tracing::Level;

/// Receives lifecycle events from a running process.
///
/// Every method defaults to a no-op so implementations only override the
/// events they care about.
pub trait ProcessObserver: Send + Sync {
    fn process_created(&self, _command_line: &str) {}

    fn stdout_read(&self, _chunk: &[u8]) {}

    fn stderr_read(&self, _chunk: &[u8]) {}

    fn signal_sent(&self, _signal: ProcessSignal) {}

    fn process_exited(&self, _exit_code: i32) {}
}

/// Observer that ignores every event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullObserver;

impl ProcessObserver for NullObserver {}

/// Fans every event out to a list of observers, in insertion order
#[derive(Clone, Default)]
pub struct AggregateObserver {
    observers: Vec<Arc<dyn ProcessObserver>>,
}

impl AggregateObserver {
    pub fn new(observers: Vec<Arc<dyn ProcessObserver>>) -> Self {
        Self { observers }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ProcessObserver for AggregateObserver {
    fn process_created(&self, command_line: &str) {
        for observer in &self.observers {
            observer.process_created(command_line);
        }
    }

    fn stdout_read(&self, chunk: &[u8]) {
        for observer in &self.observers {
            observer.stdout_read(chunk);
        }
    }

    fn stderr_read(&self, chunk: &[u8]) {
        for observer in &self.observers {
            observer.stderr_read(chunk);
        }
    }

    fn signal_sent(&self, signal: ProcessSignal) {
        for observer in &self.observers {
            observer.signal_sent(signal);
        }
    }

    fn process_exited(&self, exit_code: i32) {
        for observer in &self.observers {
            observer.process_exited(exit_code);
        }
    }
}

// tracing wants a static level per callsite
macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($arg)+),
            Level::WARN => tracing::warn!($($arg)+),
            Level::INFO => tracing::info!($($arg)+),
            Level::DEBUG => tracing::debug!($($arg)+),
            _ => tracing::trace!($($arg)+),
        }
    };
}

/// Logs every lifecycle event through `tracing`
#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    level: Level,
}

impl TracingObserver {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl ProcessObserver for TracingObserver {
    fn process_created(&self, command_line: &str) {
        event_at!(self.level, command = %command_line, "Process created");
    }

    fn stdout_read(&self, chunk: &[u8]) {
        event_at!(self.level, stdout = %String::from_utf8_lossy(chunk), "Read from stdout");
    }

    fn stderr_read(&self, chunk: &[u8]) {
        event_at!(self.level, stderr = %String::from_utf8_lossy(chunk), "Read from stderr");
    }

    fn signal_sent(&self, signal: ProcessSignal) {
        event_at!(self.level, signal = %signal, "Signal sent");
    }

    fn process_exited(&self, exit_code: i32) {
        event_at!(self.level, exit_code, "Process exited");
    }
}

/// Logs stderr output and the exit code only
#[derive(Debug, Clone, Copy)]
pub struct ErrorObserver {
    level: Level,
}

impl ErrorObserver {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Default for ErrorObserver {
    fn default() -> Self {
        Self::new(Level::ERROR)
    }
}

impl ProcessObserver for ErrorObserver {
    fn stderr_read(&self, chunk: &[u8]) {
        event_at!(self.level, stderr = %String::from_utf8_lossy(chunk), "Read from stderr");
    }

    fn process_exited(&self, exit_code: i32) {
        event_at!(self.level, exit_code, "Process exited");
    }
}

/// Logs signals sent to the process
#[derive(Debug, Clone, Copy)]
pub struct SignalObserver {
    level: Level,
}

impl SignalObserver {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Default for SignalObserver {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl ProcessObserver for SignalObserver {
    fn signal_sent(&self, signal: ProcessSignal) {
        event_at!(self.level, signal = %signal, "Signal sent");
    }
}
