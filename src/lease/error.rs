use crate::error::{ErrorCode, SwarmError};
use crate::subprocess::ProcessError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{action} failed for slot {slot}: {message}")]
    Command {
        action: &'static str,
        slot: u32,
        message: String,
    },

    #[error("Invalid {action} command template: {message}")]
    Template {
        action: &'static str,
        message: String,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Lease pool exhausted: no usable slot in 1..={max_slot}")]
    PoolExhausted { max_slot: u32 },

    #[error("Lock file I/O failed at {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Lock file {path} is unreadable: {message}")]
    CorruptLock { path: PathBuf, message: String },

    #[error("Slot {slot} did not become healthy within {waited:?}")]
    SpawnTimeout {
        slot: u32,
        waited: std::time::Duration,
    },

    #[error("Slot {0} is outside the configured range")]
    InvalidSlot(u32),

    #[error("Environment driver error: {0}")]
    Driver(#[from] DriverError),
}

impl LeaseError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LeaseError::PoolExhausted { .. })
    }

    fn slot(&self) -> Option<u32> {
        match self {
            LeaseError::SpawnTimeout { slot, .. } | LeaseError::InvalidSlot(slot) => Some(*slot),
            LeaseError::Driver(DriverError::Command { slot, .. }) => Some(*slot),
            _ => None,
        }
    }
}

impl From<LeaseError> for SwarmError {
    fn from(err: LeaseError) -> Self {
        let code = match &err {
            LeaseError::PoolExhausted { .. } => ErrorCode::LEASE_POOL_EXHAUSTED,
            LeaseError::LockIo { .. } | LeaseError::CorruptLock { .. } => ErrorCode::LEASE_LOCK_IO,
            LeaseError::SpawnTimeout { .. } => ErrorCode::LEASE_SPAWN_FAILED,
            LeaseError::InvalidSlot(_) => ErrorCode::LEASE_GENERIC,
            LeaseError::Driver(_) => ErrorCode::LEASE_DRIVER,
        };
        let slot = err.slot();
        SwarmError::lease_with_code(code, err.to_string(), slot).with_source(err)
    }
}

impl From<DriverError> for SwarmError {
    fn from(err: DriverError) -> Self {
        LeaseError::Driver(err).into()
    }
}
