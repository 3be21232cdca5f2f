use crate::models::ProcessState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Invalid command \"{0}\" provided")]
    CommandValidation(String),

    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Invalid state: expected process to be {expected}, but it is {actual}")]
    InvalidState {
        expected: ProcessState,
        actual: ProcessState,
    },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShellError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_carries_command_verbatim() {
        let err = ShellError::CommandValidation("foo bar --baz".to_string());
        assert_eq!(err.to_string(), "Invalid command \"foo bar --baz\" provided");
    }

    #[test]
    fn test_invalid_state_names_both_states() {
        let err = ShellError::InvalidState {
            expected: ProcessState::Exited,
            actual: ProcessState::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state: expected process to be exited, but it is running"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ShellError = io.into();
        assert!(matches!(err, ShellError::IoError(_)));
    }
}
