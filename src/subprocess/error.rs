use crate::error::{ErrorCode, SwarmError};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process exited with code {0}")]
    ExitCode(i32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Mock expectation not met: {0}")]
    MockExpectationNotMet(String),
}

/// Convert ProcessError to SwarmError
impl From<ProcessError> for SwarmError {
    fn from(err: ProcessError) -> Self {
        let (code, command, exit_code) = match &err {
            ProcessError::CommandNotFound(cmd) => {
                (ErrorCode::EXEC_COMMAND_NOT_FOUND, Some(cmd.clone()), None)
            }
            ProcessError::Timeout(_) => (ErrorCode::EXEC_TIMEOUT, None, None),
            ProcessError::ExitCode(code) => (ErrorCode::EXEC_SUBPROCESS_FAILED, None, Some(*code)),
            ProcessError::Io(_) => (ErrorCode::EXEC_SPAWN_FAILED, None, None),
            ProcessError::Internal(_) | ProcessError::MockExpectationNotMet(_) => {
                (ErrorCode::EXEC_GENERIC, None, None)
            }
        };

        let mut error = SwarmError::execution_with_code(code, err.to_string(), command);
        if let Some(exit_code) = exit_code {
            error = error.with_exit_code(exit_code);
        }
        error.with_source(err)
    }
}
