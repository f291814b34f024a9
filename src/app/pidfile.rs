//! Single-instance guard

use crate::error::{ErrorCode, SwarmError};
use crate::lease::is_process_running;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Pid file held for the engine's lifetime; removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Write our pid to `path`, refusing if a live process already owns it
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, SwarmError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| io_error(&path, e))?;
        }

        if let Some(existing) = read_pid(&path) {
            if existing != std::process::id() && is_process_running(existing) {
                return Err(SwarmError::config_with_code(
                    ErrorCode::CONFIG_PID_LOCKED,
                    format!(
                        "another engine (pid {}) holds {}",
                        existing,
                        path.display()
                    ),
                ));
            }
            warn!("Replacing stale pid file {} (pid {})", path.display(), existing);
        }

        let pid = std::process::id();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        writeln!(file, "{}", pid).map_err(|e| io_error(&path, e))?;
        debug!("Wrote pid {} to {}", pid, path.display());
        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(self.pid) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove pid file {}: {}", self.path.display(), e);
            }
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn io_error(path: &Path, err: std::io::Error) -> SwarmError {
    SwarmError::config_with_code(
        ErrorCode::CONFIG_GENERIC,
        format!("pid file {}: {}", path.display(), err),
    )
    .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_written_and_removed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run").join("swarm.pid");

        let guard = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_live_holder_is_refused_and_stale_one_replaced() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("swarm.pid");

        // pid 1 is always alive
        std::fs::write(&path, "1\n").unwrap();
        let err = PidFile::acquire(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_PID_LOCKED);

        std::fs::write(&path, "999999999\n").unwrap();
        let _guard = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
    }
}
