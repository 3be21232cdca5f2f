pub mod command;
pub mod environment;
pub mod mock;
pub mod process;

pub use command::{Argument, CommandBuilder, Separator, ShellCommand};
pub use environment::{detect, Environment};
#[cfg(unix)]
pub use environment::UnixEnvironment;
pub use mock::MockProcess;
pub use process::{Process, ProcessConfig, RunningProcess, DEFAULT_POLL_INTERVAL, DEFAULT_STOP_TIMEOUT};
