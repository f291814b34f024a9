//! Logging configuration and initialization

use crate::app::config::AppConfig;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{debug, trace};
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "swarm-engine.log";

/// Initialize tracing for the process
///
/// `RUST_LOG` wins over the verbosity level when set. With a log directory
/// the output goes to `swarm-engine.log` there, without ANSI colors;
/// otherwise to stderr so stdout stays free for command output.
pub fn init_logging(config: &AppConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.verbose >= 2) // Show target module for -vv and above
        .with_thread_ids(config.verbose >= 3)
        .with_line_number(config.verbose >= 3);

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_FILE_NAME))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
        }
        None => builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?,
    }

    debug!("swarm-engine started with verbosity level: {}", config.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());
    Ok(())
}
