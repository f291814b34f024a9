use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ProcessError;

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
    /// When false the child starts from an empty environment plus the
    /// essential system variables and `env`.
    pub inherit_env: bool,
}

impl ProcessCommand {
    /// Render the command line for logs and error messages
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    /// Last `max` bytes of stderr, used as failure evidence
    pub fn stderr_tail(&self, max: usize) -> &str {
        tail(&self.stderr, max)
    }
}

/// Slice the trailing `max` bytes of `text` on a char boundary
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            ExitStatus::Signal(_) => None,
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;
}

pub struct TokioProcessRunner;

/// Kills the child's process group on drop unless disarmed
///
/// The child leads its own group, so this also reaches anything it forked.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(child: &tokio::process::Child) -> Self {
        Self { pgid: child.id() }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.and_then(|id| i32::try_from(id).ok()) {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) => tracing::debug!("Killed process group {}", pgid),
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => tracing::warn!("Failed to kill process group {}: {}", pgid, e),
            }
        }
    }
}

impl TokioProcessRunner {
    /// Log command execution details
    fn log_command_start(command: &ProcessCommand) {
        tracing::debug!("Executing subprocess: {}", command.display());

        if !command.env.is_empty() {
            tracing::trace!(
                "Explicit environment variables: {:?}",
                command.env.keys().collect::<Vec<_>>()
            );
        }

        if let Some(ref dir) = command.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }

        if let Some(ref stdin) = command.stdin {
            tracing::trace!("Stdin provided: {} bytes", stdin.len());
        }
    }

    /// Configure the command with environment and working directory
    fn configure_command(
        command: &ProcessCommand,
    ) -> Result<tokio::process::Command, ProcessError> {
        let mut cmd = tokio::process::Command::new(&command.program);

        // New process group so a timeout kill takes the whole tree down
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&command.args);
        cmd.kill_on_drop(true);

        if !command.inherit_env {
            cmd.env_clear();
            Self::preserve_essential_env(&mut cmd, &command.program)?;
        }

        // Explicit variables take precedence
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        if command.stdin.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        } else {
            cmd.stdin(std::process::Stdio::null());
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        Ok(cmd)
    }

    /// Preserve essential system environment variables
    ///
    /// PATH is required; without it no program can be resolved.
    fn preserve_essential_env(
        cmd: &mut tokio::process::Command,
        program: &str,
    ) -> Result<(), ProcessError> {
        match std::env::var("PATH") {
            Ok(value) => {
                cmd.env("PATH", value);
            }
            Err(e) => {
                tracing::error!(
                    "Required environment variable PATH is not available for command '{}': {:?}",
                    program,
                    e
                );
                return Err(ProcessError::Internal(format!(
                    "PATH is not available (required for '{}')",
                    program
                )));
            }
        }

        for var in ["HOME", "USER", "SHELL", "TMPDIR", "TERM", "LANG", "LC_ALL"] {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }

        Ok(())
    }

    /// Write stdin data to the child process
    async fn write_stdin(
        child: &mut tokio::process::Child,
        stdin_data: &str,
    ) -> Result<(), ProcessError> {
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(stdin_data.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        Ok(())
    }

    /// Wait for process with optional timeout
    ///
    /// On timeout the child is dropped, which kills it (`kill_on_drop`). The
    /// caller's [`ProcessGroupGuard`] takes care of its descendants.
    async fn wait_with_timeout(
        child: tokio::process::Child,
        timeout: Option<Duration>,
    ) -> Result<std::process::Output, ProcessError> {
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, child.wait_with_output()).await
            {
                Ok(result) => result.map_err(ProcessError::Io),
                Err(_) => Err(ProcessError::Timeout(duration)),
            },
            None => child.wait_with_output().await.map_err(ProcessError::Io),
        }
    }

    /// Convert process exit status to our ExitStatus enum
    fn parse_exit_status(status: std::process::ExitStatus) -> ExitStatus {
        if status.success() {
            ExitStatus::Success
        } else if let Some(code) = status.code() {
            ExitStatus::Error(code)
        } else {
            Self::parse_signal_status(status)
        }
    }

    #[cfg(unix)]
    fn parse_signal_status(status: std::process::ExitStatus) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(signal) => ExitStatus::Signal(signal),
            None => ExitStatus::Error(1),
        }
    }

    #[cfg(not(unix))]
    fn parse_signal_status(_status: std::process::ExitStatus) -> ExitStatus {
        ExitStatus::Error(1)
    }

    /// Log the process execution result
    fn log_result(result: &ProcessOutput, command: &ProcessCommand) {
        match &result.status {
            ExitStatus::Success => {
                tracing::debug!(
                    "Subprocess completed successfully in {:?}: {}",
                    result.duration,
                    command.display()
                );
            }
            ExitStatus::Error(code) => {
                tracing::debug!(
                    "Subprocess failed with exit code {} in {:?}: {}",
                    code,
                    result.duration,
                    command.display()
                );
                if !result.stderr.is_empty() {
                    tracing::trace!("Stderr: {}", result.stderr);
                }
            }
            ExitStatus::Signal(signal) => {
                tracing::warn!(
                    "Subprocess terminated by signal {} in {:?}: {}",
                    signal,
                    result.duration,
                    command.display()
                );
            }
        }
    }

    /// Map spawn error to ProcessError
    fn map_spawn_error(error: std::io::Error, program: &str) -> ProcessError {
        if error.kind() == std::io::ErrorKind::NotFound {
            ProcessError::CommandNotFound(program.to_string())
        } else {
            ProcessError::Io(error)
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let start = std::time::Instant::now();

        Self::log_command_start(&command);

        let mut cmd = Self::configure_command(&command)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, &command.program))?;

        let mut group = ProcessGroupGuard::new(&child);

        if let Some(stdin_data) = &command.stdin {
            Self::write_stdin(&mut child, stdin_data).await?;
        }

        let output = match Self::wait_with_timeout(child, command.timeout).await {
            Ok(output) => {
                group.disarm();
                output
            }
            Err(ProcessError::Timeout(duration)) => {
                tracing::warn!(
                    "Subprocess timed out after {:?}: {}",
                    duration,
                    command.display()
                );
                return Err(ProcessError::Timeout(duration));
            }
            Err(e) => return Err(e),
        };

        let result = ProcessOutput {
            status: Self::parse_exit_status(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        };

        Self::log_result(&result, &command);

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::ProcessCommandBuilder;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "echo hello"])
            .build();

        let output = TokioProcessRunner.run(command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_passes_stdin() {
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "cat"])
            .stdin("test input".to_string())
            .build();

        let output = TokioProcessRunner.run(command).await.unwrap();
        assert_eq!(output.stdout, "test input");
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .build();

        let output = TokioProcessRunner.run(command).await.unwrap();
        assert_eq!(output.status, ExitStatus::Error(3));
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(100))
            .build();

        let result = TokioProcessRunner.run(command).await;
        assert!(matches!(result, Err(ProcessError::Timeout(_))));
    }

    #[cfg(target_os = "linux")]
    fn is_live_process(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("child.pid");
        let command = ProcessCommandBuilder::new("sh")
            .args([
                "-c",
                &format!("sleep 30 & echo $! > {}; wait", pidfile.display()),
            ])
            .timeout(Duration::from_millis(300))
            .build();

        let result = TokioProcessRunner.run(command).await;
        assert!(matches!(result, Err(ProcessError::Timeout(_))));

        let pid: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = true;
        for _ in 0..100 {
            if !is_live_process(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!alive, "background sleep {} survived the timeout", pid);
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let command = ProcessCommandBuilder::new("nonexistent_command_12345").build();

        let result = TokioProcessRunner.run(command).await;
        assert!(matches!(result, Err(ProcessError::CommandNotFound(_))));
    }

    #[tokio::test]
    async fn test_clean_environment_keeps_path_and_explicit_vars() {
        std::env::set_var("SWARM_TEST_LEAK", "secret");
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "echo \"${SWARM_TEST_LEAK:-none}:${EXPLICIT}\""])
            .env("EXPLICIT", "yes")
            .clean_env()
            .build();

        let output = TokioProcessRunner.run(command).await.unwrap();
        assert_eq!(output.stdout.trim(), "none:yes");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 10), "ab");
        assert_eq!(tail("aé", 1), "");
    }
}
