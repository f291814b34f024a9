//! Work store
//!
//! [`WorkStore`] is the engine's only view of ticket persistence. The
//! in-memory store backs tests and local runs seeded from YAML; the PostgreSQL
//! store is available with the `postgres` feature.

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgWorkStore;
pub use traits::WorkStore;
pub use types::{
    AssigneeType, StepExecutionRecord, StepRecordStatus, Ticket, TicketEvent, TicketState,
    TicketUpdate, LEASE_PLACEHOLDER,
};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// PostgreSQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PostgresConfig {
    pub url: String,
    pub schema: String,
    pub max_connections: u32,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Create missing tables on connect
    pub create_schema: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            schema: "public".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            create_schema: false,
        }
    }
}
