//! Application module
//!
//! Process-level concerns around the engine:
//! - Settings loading (TOML plus environment overrides)
//! - Logging setup
//! - Pid file guard
//! - Wiring collaborators into an [`Engine`](crate::engine::Engine)

pub mod config;
pub mod error_handling;
pub mod logging;
pub mod pidfile;
pub mod runtime;

pub use config::{AppConfig, EngineSettings};
pub use error_handling::handle_fatal_error;
pub use logging::init_logging;
pub use pidfile::PidFile;
pub use runtime::{build_engine, build_judge, build_pool, initialize_app, open_store, shutdown_signal};
