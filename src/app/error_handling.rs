//! Error handling utilities

use crate::error::SwarmError;
use tracing::error;

/// Report a fatal error and exit
///
/// A [`SwarmError`] exits with its category's exit code; anything else exits 1.
/// With `verbose >= 1` the full cause chain is printed.
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {}", error);
    eprintln!("Error: {error}");

    if verbose >= 1 {
        eprintln!("\nError chain:");
        for (i, cause) in error.chain().enumerate() {
            eprintln!("  {}: {}", i, cause);
        }
    }

    std::process::exit(exit_code_for(&error))
}

pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<SwarmError>())
        .map(SwarmError::exit_code)
        .unwrap_or(1)
}
