//! Lease pool of isolated execution environments
//!
//! - [`lock`]: atomic slot lock files with stale-holder detection
//! - [`driver`]: environment lifecycle contract and its command-template implementation
//! - [`pool`]: two-phase acquisition (reuse, then cold spawn), release and status

pub mod driver;
pub mod error;
pub mod lock;
pub mod pool;

pub use driver::{CommandDriver, DriverConfig, EnvironmentDriver};
pub use error::{DriverError, LeaseError};
pub use lock::{is_process_running, LockDir, SlotLockData};
pub use pool::{Lease, LeaseConfig, LeasePool, SlotState, SlotStatus};
