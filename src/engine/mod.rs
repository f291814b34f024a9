//! Execution engine
//!
//! The [`Engine`] polls the work store, claims eligible tickets and runs each
//! one through a [`TicketRunner`] in its own task. Verified tickets can go
//! through a final [`SentinelReviewer`] pass before they are done.

pub mod config;
pub mod scheduler;
pub mod sentinel;
pub mod shutdown;
pub mod ticket_runner;

pub use config::{EngineConfig, PollBackoff, SentinelConfig};
pub use scheduler::{Engine, PollReport};
pub use sentinel::{ReviewDisposition, SentinelReviewer, SENTINEL_REJECTED};
pub use shutdown::{ShutdownReport, SHUTDOWN_REASON};
pub use ticket_runner::{TicketDisposition, TicketRunner, SINGLE_STEP_ID};
