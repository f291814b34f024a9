use crate::agent::AgentError;
use crate::error::{ErrorCode, SwarmError};
use crate::lease::{DriverError, LeaseError};
use crate::sequencer::SequencerError;
use crate::store::StoreError;

/// Why a step could not be run at all
///
/// Agent-level failures are not errors; they come back as
/// [`StepOutcome::Failed`](super::StepOutcome::Failed).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Detected before any work ran: unknown agent, malformed workflow
    #[error("{0}")]
    Structural(SwarmError),

    /// Lease, transfer, driver, staging or store failure
    #[error("{0}")]
    Infrastructure(SwarmError),
}

impl ExecutorError {
    pub fn structural(err: impl Into<SwarmError>) -> Self {
        ExecutorError::Structural(err.into())
    }

    pub fn infrastructure(err: impl Into<SwarmError>) -> Self {
        ExecutorError::Infrastructure(err.into())
    }

    pub(crate) fn staging(message: impl Into<String>, source: std::io::Error) -> Self {
        ExecutorError::Infrastructure(
            SwarmError::execution_with_code(ErrorCode::EXEC_STAGING_FAILED, message, None)
                .with_source(source),
        )
    }

    pub(crate) fn transfer(message: impl Into<String>, source: DriverError) -> Self {
        ExecutorError::Infrastructure(
            SwarmError::execution_with_code(ErrorCode::EXEC_TRANSFER_FAILED, message, None)
                .with_source(source),
        )
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, ExecutorError::Structural(_))
    }

    pub fn error(&self) -> &SwarmError {
        match self {
            ExecutorError::Structural(e) | ExecutorError::Infrastructure(e) => e,
        }
    }

    pub fn into_inner(self) -> SwarmError {
        match self {
            ExecutorError::Structural(e) | ExecutorError::Infrastructure(e) => e,
        }
    }
}

impl From<AgentError> for ExecutorError {
    fn from(err: AgentError) -> Self {
        ExecutorError::structural(err)
    }
}

impl From<SequencerError> for ExecutorError {
    fn from(err: SequencerError) -> Self {
        ExecutorError::structural(err)
    }
}

impl From<LeaseError> for ExecutorError {
    fn from(err: LeaseError) -> Self {
        ExecutorError::infrastructure(err)
    }
}

impl From<DriverError> for ExecutorError {
    fn from(err: DriverError) -> Self {
        ExecutorError::infrastructure(err)
    }
}

impl From<StoreError> for ExecutorError {
    fn from(err: StoreError) -> Self {
        ExecutorError::infrastructure(err)
    }
}

impl From<ExecutorError> for SwarmError {
    fn from(err: ExecutorError) -> Self {
        err.into_inner()
    }
}
