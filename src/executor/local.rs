use super::{
    agent_label, read_output, ExecutorError, StepExecutor, StepOutcome, EVIDENCE_TAIL, OUTPUT_FILE,
};
use crate::agent::{sanitize_agent_name, AgentDefinition};
use crate::error::{ErrorCode, SwarmError};
use crate::subprocess::{tail, ProcessCommandBuilder, ProcessError};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

impl StepExecutor {
    /// Run the agent as a child process in its code directory
    pub(super) async fn run_local(
        &self,
        step_id: &str,
        agent: &AgentDefinition,
        input: &Value,
        timeout: Duration,
    ) -> Result<StepOutcome, ExecutorError> {
        let staging = self.staging_dir()?;
        let input_path = Self::write_input(staging.path(), input)?;
        let output_path = staging.path().join(OUTPUT_FILE);

        let argv = agent.command_argv()?;
        let command = ProcessCommandBuilder::from_argv(&argv)
            .ok_or_else(|| {
                ExecutorError::structural(SwarmError::execution_with_code(
                    ErrorCode::EXEC_GENERIC,
                    format!("agent {} has an empty command", agent.name),
                    None,
                ))
            })?
            .current_dir(&agent.code_dir)
            .env("SWARM_INPUT", &input_path.to_string_lossy())
            .env("SWARM_OUTPUT", &output_path.to_string_lossy())
            .env("SWARM_AGENT", &sanitize_agent_name(&agent.name))
            .env("SWARM_STEP_ID", step_id)
            .env("SWARM_MEMORY_MB", &agent.memory_mb.to_string())
            .timeout(timeout)
            .clean_env()
            .build();

        let output = match self.runner().run(command).await {
            Ok(output) => output,
            Err(ProcessError::Timeout(after)) => {
                return Ok(StepOutcome::failed(
                    format!("agent timed out after {:?}", after),
                    json!({"agent": agent_label(agent), "timeout_ms": after.as_millis() as u64}),
                ))
            }
            Err(ProcessError::CommandNotFound(program)) => {
                return Ok(StepOutcome::failed(
                    format!("agent command not found: {}", program),
                    json!({"agent": agent_label(agent), "command": program}),
                ))
            }
            Err(e) => {
                return Err(ExecutorError::infrastructure(
                    SwarmError::from(e).with_context(format!("running agent {}", agent.name)),
                ))
            }
        };

        if !output.status.success() {
            return Ok(StepOutcome::from_exit(&output, None));
        }

        match read_output(&output_path) {
            Ok(outputs) => {
                debug!("Agent {} wrote {}", agent.name, output_path.display());
                Ok(StepOutcome::Completed {
                    outputs,
                    slot: None,
                })
            }
            Err(message) => Ok(StepOutcome::failed(
                message,
                json!({
                    "agent": agent_label(agent),
                    "stdout_tail": tail(&output.stdout, EVIDENCE_TAIL),
                }),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ExecOptions, ExecutionMode, ExecutorConfig};
    use super::*;
    use crate::agent::InMemoryAgentRegistry;
    use crate::resolver::ResolveContext;
    use crate::sequencer::StepSpec;
    use crate::store::{MemoryStore, StepRecordStatus};
    use crate::subprocess::{MockProcessRunner, TokioProcessRunner};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn agent(name: &str, code_dir: &Path, entry: &str) -> AgentDefinition {
        serde_yaml::from_str(&format!(
            "name: {}\nversion: 1.0.0\nentry: \"{}\"\ncode_dir: {}\ntimeout: 5s\n",
            name,
            entry,
            code_dir.display()
        ))
        .unwrap()
    }

    fn executor(agents: Vec<AgentDefinition>, store: MemoryStore) -> StepExecutor {
        StepExecutor::new(
            ExecutorConfig::default(),
            Arc::new(InMemoryAgentRegistry::with_definitions(agents)),
            Arc::new(TokioProcessRunner),
            Arc::new(store),
        )
    }

    fn local() -> ExecOptions {
        ExecOptions::new("run-1").with_mode(ExecutionMode::Local)
    }

    #[tokio::test]
    async fn test_local_agent_reads_input_and_writes_output() {
        let code = TempDir::new().unwrap();
        std::fs::write(
            code.path().join("agent.sh"),
            "#!/bin/sh\nsed 's/\"n\"/\"seen\"/' \"$SWARM_INPUT\" > \"$SWARM_OUTPUT\"\n",
        )
        .unwrap();
        let store = MemoryStore::new();
        let exec = executor(vec![agent("echoer", code.path(), "sh agent.sh")], store.clone());

        let step = StepSpec::new("s1", "echoer").with_inputs(json!({"n": "${count}"}));
        let outcome = exec
            .execute_step(&step, &ResolveContext::new(json!({"count": 3})), &local())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StepOutcome::Completed {
                outputs: json!({"seen": 3}),
                slot: None
            }
        );
        let records = store.steps().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, StepRecordStatus::Completed);
    }

    #[tokio::test]
    async fn test_agent_sees_its_memory_limit() {
        let code = TempDir::new().unwrap();
        std::fs::write(
            code.path().join("agent.sh"),
            "#!/bin/sh\nprintf '{\"memory\": %s}' \"$SWARM_MEMORY_MB\" > \"$SWARM_OUTPUT\"\n",
        )
        .unwrap();
        let mut big = agent("big", code.path(), "sh agent.sh");
        big.memory_mb = 2048;
        let exec = executor(vec![big], MemoryStore::new());

        let outcome = exec
            .execute_step(&StepSpec::new("s1", "big"), &ResolveContext::new(json!({})), &local())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StepOutcome::Completed {
                outputs: json!({"memory": 2048}),
                slot: None
            }
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_failed_outcome() {
        let code = TempDir::new().unwrap();
        let exec = executor(
            vec![agent("broken", code.path(), "sh -c 'echo boom >&2; exit 3'")],
            MemoryStore::new(),
        );

        let outcome = exec
            .execute_step(&StepSpec::new("s1", "broken"), &ResolveContext::default(), &local())
            .await
            .unwrap();
        match outcome {
            StepOutcome::Failed { error, evidence } => {
                assert!(error.contains("code 3"));
                assert_eq!(evidence["exit_code"], json!(3));
                assert!(evidence["stderr_tail"].as_str().unwrap().contains("boom"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_output_is_a_failed_outcome() {
        let code = TempDir::new().unwrap();
        let exec = executor(vec![agent("quiet", code.path(), "true")], MemoryStore::new());

        let outcome = exec
            .execute_step(&StepSpec::new("s1", "quiet"), &ResolveContext::default(), &local())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { ref error, .. } if error.contains("no output.json")));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failed_outcome() {
        let code = TempDir::new().unwrap();
        let runner = MockProcessRunner::new();
        runner
            .expect_command("slow")
            .times_out(Duration::from_secs(5))
            .finish();
        let exec = StepExecutor::new(
            ExecutorConfig::default(),
            Arc::new(InMemoryAgentRegistry::with_definitions(vec![agent(
                "slow",
                code.path(),
                "slow",
            )])),
            Arc::new(runner),
            Arc::new(MemoryStore::new()),
        );

        let outcome = exec
            .execute_step(&StepSpec::new("s1", "slow"), &ResolveContext::default(), &local())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { ref error, .. } if error.contains("timed out")));
    }
}
