use super::{
    agent_label, read_output, ExecOptions, ExecutorError, StepExecutor, StepOutcome, INPUT_FILE,
    OUTPUT_FILE,
};
use crate::agent::{sanitize_agent_name, AgentDefinition, AgentError};
use crate::error::{ErrorCode, SwarmError};
use crate::lease::{DriverError, EnvironmentDriver, Lease};
use crate::resolver::shell_escape;
use crate::store::StepExecutionRecord;
use crate::subprocess::ProcessError;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exit status of `timeout -s KILL` when it had to kill the agent
const KILLED_BY_TIMEOUT: i32 = 137;

/// Shell command that runs the agent from its pushed code directory
///
/// The agent is wrapped in `timeout -s KILL` so it dies inside the
/// environment even when the connection running it is cut first.
pub fn remote_command(
    workdir: &str,
    address: &str,
    agent: &AgentDefinition,
    timeout: Duration,
) -> Result<String, AgentError> {
    let entry = agent
        .command_argv()?
        .iter()
        .map(|arg| shell_escape(arg))
        .collect::<Vec<_>>()
        .join(" ");
    let seconds = u64::try_from(timeout.as_millis())
        .unwrap_or(u64::MAX)
        .div_ceil(1000)
        .max(1);
    Ok(format!(
        "cd {dir} && SWARM_INPUT={input} SWARM_OUTPUT={output} SWARM_VM_IP={ip} SWARM_AGENT={name} \
         SWARM_MEMORY_MB={memory} timeout -s KILL {seconds} {entry}",
        dir = shell_escape(&format!("{}/agent", workdir)),
        input = shell_escape(&format!("{}/{}", workdir, INPUT_FILE)),
        output = shell_escape(&format!("{}/{}", workdir, OUTPUT_FILE)),
        ip = shell_escape(address),
        name = sanitize_agent_name(&agent.name),
        memory = agent.memory_mb,
        seconds = seconds,
        entry = entry,
    ))
}

impl StepExecutor {
    /// Run the agent inside a leased environment
    ///
    /// The lease is released on every path, after the run's working directory
    /// is removed. A slot whose exec was cut off is torn down first. The
    /// ticket's lease id goes back to the placeholder unless a sibling step
    /// has recorded its own slot since.
    pub(super) async fn run_leased(
        &self,
        agent: &AgentDefinition,
        input: &Value,
        timeout: Duration,
        options: &ExecOptions,
        record: Option<&StepExecutionRecord>,
    ) -> Result<StepOutcome, ExecutorError> {
        let pool = self.pool().cloned().ok_or_else(|| {
            ExecutorError::infrastructure(SwarmError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "leased execution requested but no lease pool is configured",
            ))
        })?;

        let lease = pool.acquire().await?;
        let slot = lease.slot();
        info!(
            "Agent {} leased slot {} ({})",
            agent.name,
            slot,
            lease.address()
        );
        if let Some(record) = record {
            let mut held = record.clone();
            held.slot = Some(slot);
            self.save_record(&held).await;
        }

        let driver = pool.driver();
        let workdir = format!(
            "{}/{}-{}",
            self.config().remote_root.trim_end_matches('/'),
            sanitize_agent_name(&options.run_id),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut interrupted = false;
        let result = self
            .run_on_slot(
                driver.as_ref(),
                &lease,
                &workdir,
                agent,
                input,
                timeout,
                options,
                &mut interrupted,
            )
            .await;

        if interrupted {
            warn!("Tearing down slot {} after an interrupted exec", slot);
            if let Err(e) = driver.teardown(slot).await {
                warn!("Teardown of slot {} failed: {}", slot, e);
            }
        } else if let Err(e) = driver.remove(slot, &workdir).await {
            warn!("Failed to remove {} on slot {}: {}", workdir, slot, e);
        }
        if let Err(e) = lease.release() {
            warn!("Failed to release slot {}: {}", slot, e);
        }
        if let Some(ticket_id) = &options.ticket_id {
            if let Err(e) = self.store().reset_lease(ticket_id, i64::from(slot)).await {
                warn!("Failed to reset lease on ticket {}: {}", ticket_id, e);
            }
        }
        result
    }

    /// Sets `interrupted` when the exec was cut off and may still be running
    #[allow(clippy::too_many_arguments)]
    async fn run_on_slot(
        &self,
        driver: &dyn EnvironmentDriver,
        lease: &Lease,
        workdir: &str,
        agent: &AgentDefinition,
        input: &Value,
        timeout: Duration,
        options: &ExecOptions,
        interrupted: &mut bool,
    ) -> Result<StepOutcome, ExecutorError> {
        let slot = lease.slot();
        if let Some(ticket_id) = &options.ticket_id {
            if !self.store().set_lease(ticket_id, i64::from(slot)).await? {
                warn!("Ticket {} is no longer active; slot {} not recorded", ticket_id, slot);
            }
        }

        let staging = self.staging_dir()?;
        let input_path = Self::write_input(staging.path(), input)?;

        driver
            .push(slot, &agent.code_dir, &format!("{}/agent", workdir))
            .await
            .map_err(|e| ExecutorError::transfer(format!("pushing agent code to slot {}", slot), e))?;
        driver
            .push(slot, &input_path, &format!("{}/{}", workdir, INPUT_FILE))
            .await
            .map_err(|e| ExecutorError::transfer(format!("pushing input to slot {}", slot), e))?;

        let command = remote_command(workdir, lease.address(), agent, timeout)?;
        debug!("Remote command on slot {}: {}", slot, command);

        let limit = timeout + self.config().exec_grace;
        let exec = tokio::time::timeout(limit, driver.exec(slot, &command, limit)).await;
        let output = match exec {
            Ok(Ok(output)) if output.status.code() == Some(KILLED_BY_TIMEOUT) => {
                return Ok(self.timed_out(driver, slot, workdir, &staging, agent, timeout).await);
            }
            Ok(Ok(output)) => output,
            Ok(Err(DriverError::Process(ProcessError::Timeout(_)))) | Err(_) => {
                *interrupted = true;
                return Ok(self.timed_out(driver, slot, workdir, &staging, agent, timeout).await);
            }
            Ok(Err(e)) => {
                return Err(ExecutorError::infrastructure(
                    SwarmError::from(e).with_context(format!("exec on slot {}", slot)),
                ))
            }
        };

        if !output.status.success() {
            let partial = pull_output(driver, slot, workdir, staging.path()).await;
            let mut outcome = StepOutcome::from_exit(&output, Some(slot));
            if let StepOutcome::Failed { evidence, .. } = &mut outcome {
                evidence["agent"] = json!(agent_label(agent));
                evidence["partial_output"] = partial.ok().unwrap_or(Value::Null);
            }
            return Ok(outcome);
        }

        match pull_output(driver, slot, workdir, staging.path()).await {
            Ok(outputs) => Ok(StepOutcome::Completed {
                outputs,
                slot: Some(slot),
            }),
            Err(message) => Ok(StepOutcome::failed(
                message,
                json!({"agent": agent_label(agent), "slot": slot}),
            )),
        }
    }

    async fn timed_out(
        &self,
        driver: &dyn EnvironmentDriver,
        slot: u32,
        workdir: &str,
        staging: &tempfile::TempDir,
        agent: &AgentDefinition,
        timeout: Duration,
    ) -> StepOutcome {
        let partial = pull_output(driver, slot, workdir, staging.path()).await;
        StepOutcome::failed(
            format!("agent timed out after {:?} on slot {}", timeout, slot),
            json!({
                "agent": agent_label(agent),
                "slot": slot,
                "timeout_ms": timeout.as_millis() as u64,
                "partial_output": partial.ok(),
            }),
        )
    }
}

/// Copy the output artifact back and parse it
async fn pull_output(
    driver: &dyn EnvironmentDriver,
    slot: u32,
    workdir: &str,
    staging: &Path,
) -> Result<Value, String> {
    let local = staging.join(OUTPUT_FILE);
    let remote = format!("{}/{}", workdir, OUTPUT_FILE);
    if let Err(e) = driver.pull(slot, &remote, &local).await {
        debug!("No output pulled from slot {}: {}", slot, e);
        return Err("agent produced no output.json".to_string());
    }
    read_output(&local)
}
