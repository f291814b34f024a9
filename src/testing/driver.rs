//! In-memory environment driver
//!
//! Each slot gets a directory under a private temp root that stands in for the
//! environment's filesystem; `push`/`pull` copy into and out of it and `exec`
//! hands the command to a test-supplied handler.

use crate::lease::{DriverError, EnvironmentDriver};
use crate::subprocess::{ExitStatus, ProcessOutput};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

static ENV_ASSIGNMENT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|\s)([A-Z_][A-Z0-9_]*)=('(?:[^']|'\\'')*'|\S+)"#)
        .expect("valid env assignment regex")
});

/// A command sent to [`MockEnvironmentDriver::exec`]
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub slot: u32,
    pub command: String,
    pub root: PathBuf,
}

impl ExecRequest {
    /// Map an absolute path inside the environment onto the local root
    pub fn remote_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Value of a `NAME=value` assignment in the command line
    pub fn env_value(&self, name: &str) -> Option<String> {
        ENV_ASSIGNMENT_REGEX
            .captures_iter(&self.command)
            .find(|caps| &caps[1] == name)
            .map(|caps| {
                let raw = &caps[2];
                raw.strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .map(|s| s.replace("'\\''", "'"))
                    .unwrap_or_else(|| raw.to_string())
            })
    }

    pub fn read_input(&self) -> Option<Value> {
        let path = self.remote_path(&self.env_value("SWARM_INPUT")?);
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn write_output(&self, value: &Value) {
        if let Some(path) = self.env_value("SWARM_OUTPUT") {
            let path = self.remote_path(&path);
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::write(path, value.to_string());
        }
    }
}

pub type ExecHandler =
    Arc<dyn Fn(&ExecRequest) -> Result<ProcessOutput, DriverError> + Send + Sync>;

struct DriverState {
    running: HashSet<u32>,
    unresponsive: HashSet<u32>,
    failing_spawn: HashSet<u32>,
    fail_push: bool,
    exec_delay: Option<Duration>,
    spawns: usize,
    execs: Vec<ExecRequest>,
    removed: Vec<(u32, String)>,
    handler: Option<ExecHandler>,
}

#[derive(Clone)]
pub struct MockEnvironmentDriver {
    state: Arc<Mutex<DriverState>>,
    root: Arc<TempDir>,
}

impl MockEnvironmentDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DriverState {
                running: HashSet::new(),
                unresponsive: HashSet::new(),
                failing_spawn: HashSet::new(),
                fail_push: false,
                exec_delay: None,
                spawns: 0,
                execs: Vec::new(),
                removed: Vec::new(),
                handler: None,
            })),
            root: Arc::new(TempDir::new().expect("temp dir for mock environments")),
        }
    }

    /// Slot already has a running environment
    pub fn with_running(self, slot: u32) -> Self {
        self.state.lock().unwrap().running.insert(slot);
        self
    }

    /// Slot never answers probes
    pub fn with_unresponsive(self, slot: u32) -> Self {
        self.state.lock().unwrap().unresponsive.insert(slot);
        self
    }

    pub fn with_failing_spawn(self, slot: u32) -> Self {
        self.state.lock().unwrap().failing_spawn.insert(slot);
        self
    }

    pub fn with_failing_push(self) -> Self {
        self.state.lock().unwrap().fail_push = true;
        self
    }

    /// Every exec sleeps this long before the handler runs
    pub fn with_exec_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().exec_delay = Some(delay);
        self
    }

    pub fn on_exec<F>(self, handler: F) -> Self
    where
        F: Fn(&ExecRequest) -> Result<ProcessOutput, DriverError> + Send + Sync + 'static,
    {
        self.state.lock().unwrap().handler = Some(Arc::new(handler));
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawns
    }

    pub fn exec_history(&self) -> Vec<ExecRequest> {
        self.state.lock().unwrap().execs.clone()
    }

    /// Paths passed to `remove`, in call order
    pub fn removed_paths(&self) -> Vec<(u32, String)> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn slot_root(&self, slot: u32) -> PathBuf {
        self.root.path().join(format!("slot-{}", slot))
    }
}

impl Default for MockEnvironmentDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Successful process output with the given stdout
pub fn exec_success(stdout: &str) -> ProcessOutput {
    ProcessOutput {
        status: ExitStatus::Success,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration: Duration::from_millis(5),
    }
}

pub fn exec_failure(code: i32, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        status: ExitStatus::Error(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration: Duration::from_millis(5),
    }
}

fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

fn transfer_error(action: &'static str, slot: u32, err: std::io::Error) -> DriverError {
    DriverError::Command {
        action,
        slot,
        message: err.to_string(),
    }
}

#[async_trait]
impl EnvironmentDriver for MockEnvironmentDriver {
    async fn exists(&self, slot: u32) -> Result<bool, DriverError> {
        Ok(self.state.lock().unwrap().running.contains(&slot))
    }

    async fn spawn(&self, slot: u32) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.spawns += 1;
        if state.failing_spawn.contains(&slot) {
            return Err(DriverError::Command {
                action: "spawn",
                slot,
                message: "mock spawn failure".to_string(),
            });
        }
        state.running.insert(slot);
        Ok(())
    }

    async fn probe(&self, slot: u32) -> Result<bool, DriverError> {
        let state = self.state.lock().unwrap();
        Ok(state.running.contains(&slot) && !state.unresponsive.contains(&slot))
    }

    async fn teardown(&self, slot: u32) -> Result<(), DriverError> {
        self.state.lock().unwrap().running.remove(&slot);
        let _ = std::fs::remove_dir_all(self.slot_root(slot));
        Ok(())
    }

    async fn exec(
        &self,
        slot: u32,
        command: &str,
        _timeout: Duration,
    ) -> Result<ProcessOutput, DriverError> {
        let request = ExecRequest {
            slot,
            command: command.to_string(),
            root: self.slot_root(slot),
        };
        let (handler, delay) = {
            let mut state = self.state.lock().unwrap();
            state.execs.push(request.clone());
            (state.handler.clone(), state.exec_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match handler {
            Some(handler) => handler(&request),
            None => Ok(exec_success("")),
        }
    }

    async fn push(&self, slot: u32, src: &Path, dst: &str) -> Result<(), DriverError> {
        if self.state.lock().unwrap().fail_push {
            return Err(DriverError::Command {
                action: "push",
                slot,
                message: "mock push failure".to_string(),
            });
        }
        let target = self.slot_root(slot).join(dst.trim_start_matches('/'));
        copy_recursive(src, &target).map_err(|e| transfer_error("push", slot, e))
    }

    async fn pull(&self, slot: u32, src: &str, dst: &Path) -> Result<(), DriverError> {
        let source = self.slot_root(slot).join(src.trim_start_matches('/'));
        copy_recursive(&source, dst).map_err(|e| transfer_error("pull", slot, e))
    }

    async fn remove(&self, slot: u32, path: &str) -> Result<(), DriverError> {
        self.state
            .lock()
            .unwrap()
            .removed
            .push((slot, path.to_string()));
        let target = self.slot_root(slot).join(path.trim_start_matches('/'));
        match std::fs::remove_dir_all(&target) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(transfer_error("remove", slot, e))
            }
            _ => Ok(()),
        }
    }

    fn address(&self, slot: u32) -> String {
        format!("10.0.0.{}", slot)
    }
}
