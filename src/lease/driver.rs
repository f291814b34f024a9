//! Execution environment lifecycle
//!
//! The pool and the leased executor only talk to environments through
//! [`EnvironmentDriver`]. [`CommandDriver`] maps each operation onto an
//! operator-configured command template run through the subprocess layer.

use super::error::DriverError;
use crate::resolver::shell_escape;
use crate::subprocess::{ProcessCommandBuilder, ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait EnvironmentDriver: Send + Sync {
    /// Whether an environment is already provisioned at `slot`
    async fn exists(&self, slot: u32) -> Result<bool, DriverError>;

    async fn spawn(&self, slot: u32) -> Result<(), DriverError>;

    /// Whether the environment at `slot` answers
    async fn probe(&self, slot: u32) -> Result<bool, DriverError>;

    async fn teardown(&self, slot: u32) -> Result<(), DriverError>;

    /// Run a shell command line inside the environment
    async fn exec(
        &self,
        slot: u32,
        command: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, DriverError>;

    /// Copy a local path into the environment
    async fn push(&self, slot: u32, src: &Path, dst: &str) -> Result<(), DriverError>;

    /// Copy a path out of the environment
    async fn pull(&self, slot: u32, src: &str, dst: &Path) -> Result<(), DriverError>;

    /// Delete a path inside the environment
    async fn remove(&self, slot: u32, path: &str) -> Result<(), DriverError>;

    /// Network identity of the environment at `slot`
    fn address(&self, slot: u32) -> String;
}

/// Command templates for [`CommandDriver`]
///
/// Templates may use `{slot}`, `{ip}`, `{src}`, `{dst}` and `{command}`.
/// Substituted values are shell-quoted before the template is split into argv.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    pub exists: String,
    pub spawn: String,
    pub probe: String,
    pub teardown: String,
    pub exec: String,
    pub push: String,
    pub pull: String,
    pub ip_template: String,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            exists: "swarm-vm exists {slot}".to_string(),
            spawn: "swarm-vm spawn {slot}".to_string(),
            probe: "ssh -o ConnectTimeout=2 -o StrictHostKeyChecking=no root@{ip} true".to_string(),
            teardown: "swarm-vm teardown {slot}".to_string(),
            exec: "ssh -o StrictHostKeyChecking=no root@{ip} {command}".to_string(),
            push: "scp -r -o StrictHostKeyChecking=no {src} root@{ip}:{dst}".to_string(),
            pull: "scp -r -o StrictHostKeyChecking=no root@{ip}:{src} {dst}".to_string(),
            ip_template: "10.0.0.{slot}".to_string(),
            command_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Default)]
struct Substitutions<'a> {
    src: Option<&'a str>,
    dst: Option<&'a str>,
    command: Option<&'a str>,
}

pub struct CommandDriver {
    config: DriverConfig,
    runner: Arc<dyn ProcessRunner>,
}

impl CommandDriver {
    pub fn new(config: DriverConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    /// Expand a template into argv
    fn render(
        &self,
        action: &'static str,
        template: &str,
        slot: u32,
        subs: Substitutions<'_>,
    ) -> Result<Vec<String>, DriverError> {
        let mut line = template
            .replace("{slot}", &slot.to_string())
            .replace("{ip}", &shell_escape(&self.address(slot)));
        if let Some(src) = subs.src {
            line = line.replace("{src}", &shell_escape(src));
        }
        if let Some(dst) = subs.dst {
            line = line.replace("{dst}", &shell_escape(dst));
        }
        if let Some(command) = subs.command {
            line = line.replace("{command}", &shell_escape(command));
        }

        let argv = shell_words::split(&line).map_err(|e| DriverError::Template {
            action,
            message: e.to_string(),
        })?;
        if argv.is_empty() {
            return Err(DriverError::Template {
                action,
                message: "template is empty".to_string(),
            });
        }
        Ok(argv)
    }

    async fn run(
        &self,
        action: &'static str,
        template: &str,
        slot: u32,
        subs: Substitutions<'_>,
        timeout: Duration,
    ) -> Result<ProcessOutput, DriverError> {
        let argv = self.render(action, template, slot, subs)?;
        let command = ProcessCommandBuilder::from_argv(&argv)
            .ok_or_else(|| DriverError::Template {
                action,
                message: "template is empty".to_string(),
            })?
            .timeout(timeout)
            .build();
        debug!("Slot {} {}: {}", slot, action, command.display());
        Ok(self.runner.run(command).await?)
    }

    /// Run a command that must exit zero
    async fn run_checked(
        &self,
        action: &'static str,
        template: &str,
        slot: u32,
        subs: Substitutions<'_>,
    ) -> Result<(), DriverError> {
        let output = self
            .run(action, template, slot, subs, self.config.command_timeout)
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::Command {
                action,
                slot,
                message: format!(
                    "exit {:?}: {}",
                    output.status.code(),
                    output.stderr_tail(500)
                ),
            })
        }
    }
}

#[async_trait]
impl EnvironmentDriver for CommandDriver {
    async fn exists(&self, slot: u32) -> Result<bool, DriverError> {
        let output = self
            .run(
                "exists",
                &self.config.exists,
                slot,
                Substitutions::default(),
                self.config.command_timeout,
            )
            .await?;
        Ok(output.status.success())
    }

    async fn spawn(&self, slot: u32) -> Result<(), DriverError> {
        self.run_checked("spawn", &self.config.spawn, slot, Substitutions::default())
            .await
    }

    async fn probe(&self, slot: u32) -> Result<bool, DriverError> {
        match self
            .run(
                "probe",
                &self.config.probe,
                slot,
                Substitutions::default(),
                self.config.command_timeout,
            )
            .await
        {
            Ok(output) => Ok(output.status.success()),
            Err(DriverError::Process(crate::subprocess::ProcessError::Timeout(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn teardown(&self, slot: u32) -> Result<(), DriverError> {
        self.run_checked(
            "teardown",
            &self.config.teardown,
            slot,
            Substitutions::default(),
        )
        .await
    }

    async fn exec(
        &self,
        slot: u32,
        command: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, DriverError> {
        self.run(
            "exec",
            &self.config.exec,
            slot,
            Substitutions {
                command: Some(command),
                ..Substitutions::default()
            },
            timeout,
        )
        .await
    }

    async fn push(&self, slot: u32, src: &Path, dst: &str) -> Result<(), DriverError> {
        let src = src.to_string_lossy();
        self.run_checked(
            "push",
            &self.config.push,
            slot,
            Substitutions {
                src: Some(&src),
                dst: Some(dst),
                ..Substitutions::default()
            },
        )
        .await
    }

    async fn pull(&self, slot: u32, src: &str, dst: &Path) -> Result<(), DriverError> {
        let dst = dst.to_string_lossy();
        self.run_checked(
            "pull",
            &self.config.pull,
            slot,
            Substitutions {
                src: Some(src),
                dst: Some(&dst),
                ..Substitutions::default()
            },
        )
        .await
    }

    async fn remove(&self, slot: u32, path: &str) -> Result<(), DriverError> {
        let command = format!("rm -rf -- {}", shell_escape(path));
        self.run_checked(
            "remove",
            &self.config.exec,
            slot,
            Substitutions {
                command: Some(&command),
                ..Substitutions::default()
            },
        )
        .await
    }

    fn address(&self, slot: u32) -> String {
        self.config.ip_template.replace("{slot}", &slot.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::MockProcessRunner;

    fn driver() -> (CommandDriver, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let driver = CommandDriver::new(DriverConfig::default(), Arc::new(mock.clone()));
        (driver, mock)
    }

    #[test]
    fn test_address_from_template() {
        let (driver, _) = driver();
        assert_eq!(driver.address(7), "10.0.0.7");
    }

    #[test]
    fn test_render_quotes_command_as_single_argument() {
        let (driver, _) = driver();
        let argv = driver
            .render(
                "exec",
                "ssh root@{ip} {command}",
                3,
                Substitutions {
                    command: Some("cd /agent && SWARM_VM_IP=10.0.0.3 ./run; rm -rf /"),
                    ..Substitutions::default()
                },
            )
            .unwrap();
        assert_eq!(
            argv,
            vec![
                "ssh",
                "root@10.0.0.3",
                "cd /agent && SWARM_VM_IP=10.0.0.3 ./run; rm -rf /"
            ]
        );
    }

    #[tokio::test]
    async fn test_exists_maps_exit_status() {
        let (driver, mock) = driver();
        mock.expect_command("swarm-vm")
            .with_args(|args| args == ["exists", "1"])
            .returns_success()
            .finish();
        mock.expect_command("swarm-vm")
            .with_args(|args| args == ["exists", "2"])
            .returns_exit_code(1)
            .finish();

        assert!(driver.exists(1).await.unwrap());
        assert!(!driver.exists(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unresponsive() {
        let (driver, mock) = driver();
        mock.expect_command("ssh")
            .times_out(Duration::from_secs(2))
            .finish();
        assert!(!driver.probe(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_stderr() {
        let (driver, mock) = driver();
        mock.expect_command("swarm-vm")
            .returns_exit_code(2)
            .returns_stderr("no kernel image")
            .finish();

        let err = driver.spawn(4).await.unwrap_err();
        assert!(err.to_string().contains("no kernel image"));
        assert!(matches!(err, DriverError::Command { slot: 4, .. }));
    }

    #[tokio::test]
    async fn test_remove_runs_rm_through_exec_template() {
        let (driver, mock) = driver();
        mock.expect_command("ssh")
            .with_args(|args| args.last().map(String::as_str) == Some("rm -rf -- '/tmp/swarm/run 1'"))
            .returns_success()
            .finish();

        driver.remove(2, "/tmp/swarm/run 1").await.unwrap();
        assert!(mock.verify_called("ssh", 1));
    }
}
