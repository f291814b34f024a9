//! Step execution
//!
//! Runs one step, either as a local child process or inside a leased
//! environment. The caller gets back a [`StepOutcome`] for anything the agent
//! itself did (including failing), and an [`ExecutorError`] only when the step
//! could not be run at all.

pub mod error;
mod leased;
mod local;

pub use error::ExecutorError;

use crate::agent::{AgentDefinition, AgentRef, AgentRegistry};
use crate::lease::LeasePool;
use crate::resolver::{evaluate_condition, resolve, ResolveContext};
use crate::sequencer::StepSpec;
use crate::store::{StepExecutionRecord, StepRecordStatus, WorkStore};
use crate::subprocess::{tail, ProcessOutput, ProcessRunner};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) const INPUT_FILE: &str = "input.json";
pub(crate) const OUTPUT_FILE: &str = "output.json";
const EVIDENCE_TAIL: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Child process on the engine host
    Local,
    /// Inside a leased environment
    #[default]
    Leased,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub default_mode: ExecutionMode,
    /// Parent directory for local staging dirs; system temp when unset
    pub staging_dir: Option<PathBuf>,
    /// Per-run working directories are created under this path in the environment
    pub remote_root: String,
    /// Extra time allowed on top of the agent timeout for a remote exec
    #[serde(with = "humantime_serde")]
    pub exec_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_mode: ExecutionMode::Leased,
            staging_dir: None,
            remote_root: "/tmp/swarm".to_string(),
            exec_grace: Duration::from_secs(30),
        }
    }
}

/// Per-call settings
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub run_id: String,
    pub ticket_id: Option<String>,
    /// Used when the step does not pick a mode
    pub mode: ExecutionMode,
    pub record_steps: bool,
    /// Added to object inputs without replacing keys already present
    pub extra_inputs: Map<String, Value>,
}

impl ExecOptions {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ticket_id: None,
            mode: ExecutionMode::default(),
            record_steps: true,
            extra_inputs: Map::new(),
        }
    }

    pub fn for_ticket(mut self, ticket_id: impl Into<String>) -> Self {
        self.ticket_id = Some(ticket_id.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn without_records(mut self) -> Self {
        self.record_steps = false;
        self
    }

    pub fn with_extra_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_inputs.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed { outputs: Value, slot: Option<u32> },
    Failed { error: String, evidence: Value },
    Skipped { reason: String },
}

impl StepOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed { .. })
    }

    pub(crate) fn failed(error: impl Into<String>, evidence: Value) -> Self {
        StepOutcome::Failed {
            error: error.into(),
            evidence,
        }
    }

    /// Failure built from a finished agent process
    pub(crate) fn from_exit(output: &ProcessOutput, slot: Option<u32>) -> Self {
        let error = match output.status.code() {
            Some(code) => format!("agent exited with code {}", code),
            None => "agent terminated by signal".to_string(),
        };
        StepOutcome::failed(
            error,
            json!({
                "exit_code": output.status.code(),
                "stderr_tail": output.stderr_tail(EVIDENCE_TAIL),
                "stdout_tail": tail(&output.stdout, EVIDENCE_TAIL),
                "duration_ms": output.duration.as_millis() as u64,
                "slot": slot,
            }),
        )
    }

    fn slot(&self) -> Option<u32> {
        match self {
            StepOutcome::Completed { slot, .. } => *slot,
            StepOutcome::Failed { evidence, .. } => evidence
                .get("slot")
                .and_then(Value::as_u64)
                .and_then(|s| u32::try_from(s).ok()),
            StepOutcome::Skipped { .. } => None,
        }
    }
}

/// Parse the agent's output artifact
pub(crate) fn read_output(path: &Path) -> Result<Value, String> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => "agent produced no output.json".to_string(),
        _ => format!("failed to read output.json: {}", e),
    })?;
    serde_json::from_str(&text).map_err(|e| format!("malformed output.json: {}", e))
}

pub struct StepExecutor {
    config: ExecutorConfig,
    registry: Arc<dyn AgentRegistry>,
    runner: Arc<dyn ProcessRunner>,
    store: Arc<dyn WorkStore>,
    pool: Option<Arc<LeasePool>>,
}

impl StepExecutor {
    pub fn new(
        config: ExecutorConfig,
        registry: Arc<dyn AgentRegistry>,
        runner: Arc<dyn ProcessRunner>,
        store: Arc<dyn WorkStore>,
    ) -> Self {
        Self {
            config,
            registry,
            runner,
            store,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<LeasePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn pool(&self) -> Option<&Arc<LeasePool>> {
        self.pool.as_ref()
    }

    /// Resolve every step's agent without running anything
    pub async fn check_agents(&self, steps: &[StepSpec]) -> Result<(), ExecutorError> {
        for step in steps {
            let reference = AgentRef::parse(&step.agent)?;
            self.registry.lookup(&reference).await?;
        }
        Ok(())
    }

    /// Run one step against `context`
    ///
    /// `context` should already carry the step's prerequisite outputs under
    /// `deps` (see [`ResolveContext::for_step`]).
    pub async fn execute_step(
        &self,
        step: &StepSpec,
        context: &ResolveContext,
        options: &ExecOptions,
    ) -> Result<StepOutcome, ExecutorError> {
        if let Some(condition) = &step.condition {
            if !evaluate_condition(condition, context) {
                let reason = format!("condition '{}' is false", condition);
                info!("Skipping step {}: {}", step.id, reason);
                if options.record_steps {
                    let record = self.start_record(step, options);
                    self.save_record(&record.finish(StepRecordStatus::Skipped, Some(reason.clone())))
                        .await;
                }
                return Ok(StepOutcome::Skipped { reason });
            }
        }

        let reference = AgentRef::parse(&step.agent)?;
        let agent = self.registry.lookup(&reference).await?;
        let input = prepare_input(step, context, options);
        let timeout = step.timeout.unwrap_or(agent.timeout);
        let mode = step.mode.unwrap_or(options.mode);

        let record = options.record_steps.then(|| self.start_record(step, options));
        if let Some(record) = &record {
            self.save_record(record).await;
        }

        info!(
            "Running step {} with agent {}@{} ({:?}, timeout {:?})",
            step.id, agent.name, agent.version, mode, timeout
        );
        let result = match mode {
            ExecutionMode::Local => self.run_local(&step.id, &agent, &input, timeout).await,
            ExecutionMode::Leased => {
                self.run_leased(&agent, &input, timeout, options, record.as_ref())
                    .await
            }
        };

        if let Some(mut record) = record {
            record.slot = result.as_ref().ok().and_then(StepOutcome::slot);
            let finished = match &result {
                Ok(StepOutcome::Completed { .. }) => record.finish(StepRecordStatus::Completed, None),
                Ok(StepOutcome::Failed { error, .. }) => {
                    record.finish(StepRecordStatus::Failed, Some(error.clone()))
                }
                Ok(StepOutcome::Skipped { reason }) => {
                    record.finish(StepRecordStatus::Skipped, Some(reason.clone()))
                }
                Err(e) => record.finish(StepRecordStatus::Failed, Some(e.to_string())),
            };
            self.save_record(&finished).await;
        }

        match &result {
            Ok(StepOutcome::Completed { .. }) => info!("Step {} completed", step.id),
            Ok(StepOutcome::Failed { error, .. }) => warn!("Step {} failed: {}", step.id, error),
            Ok(StepOutcome::Skipped { .. }) => {}
            Err(e) => warn!("Step {} could not run: {}", step.id, e),
        }
        result
    }

    fn start_record(&self, step: &StepSpec, options: &ExecOptions) -> StepExecutionRecord {
        StepExecutionRecord::start(
            options.ticket_id.clone(),
            options.run_id.clone(),
            step.id.clone(),
            step.agent.clone(),
        )
    }

    async fn save_record(&self, record: &StepExecutionRecord) {
        if let Err(e) = self.store.record_step(record).await {
            warn!("Failed to record step {}: {}", record.step_id, e);
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    pub(crate) fn runner(&self) -> &Arc<dyn ProcessRunner> {
        &self.runner
    }

    pub(crate) fn staging_dir(&self) -> Result<tempfile::TempDir, ExecutorError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("swarm-step-");
        let dir = match &self.config.staging_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ExecutorError::staging(
                        format!("failed to create staging root {}", parent.display()),
                        e,
                    )
                })?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        };
        let dir = dir.map_err(|e| ExecutorError::staging("failed to create staging dir", e))?;
        debug!("Staging in {}", dir.path().display());
        Ok(dir)
    }

    pub(crate) fn write_input(dir: &Path, input: &Value) -> Result<PathBuf, ExecutorError> {
        let path = dir.join(INPUT_FILE);
        let body = serde_json::to_vec_pretty(input).map_err(|e| {
            ExecutorError::staging("failed to encode step input", std::io::Error::other(e))
        })?;
        std::fs::write(&path, body)
            .map_err(|e| ExecutorError::staging(format!("failed to write {}", path.display()), e))?;
        Ok(path)
    }
}

/// Resolve a step's inputs and add fan-in and caller-supplied keys
pub fn prepare_input(step: &StepSpec, context: &ResolveContext, options: &ExecOptions) -> Value {
    let mut input = resolve(&step.inputs, context);
    if input.is_null() {
        input = Value::Object(Map::new());
    }
    if let Value::Object(map) = &mut input {
        if step.depends_on.len() >= 2 && !map.contains_key("deps") {
            map.insert("deps".to_string(), Value::Object(context.deps.clone()));
        }
        for (key, value) in &options.extra_inputs {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    input
}

/// Agent metadata included in outputs and evidence
pub(crate) fn agent_label(agent: &AgentDefinition) -> String {
    format!("{}@{}", agent.name, agent.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::InMemoryAgentRegistry;
    use crate::store::MemoryStore;
    use crate::subprocess::MockProcessRunner;

    fn executor(store: MemoryStore) -> StepExecutor {
        StepExecutor::new(
            ExecutorConfig::default(),
            Arc::new(InMemoryAgentRegistry::new()),
            Arc::new(MockProcessRunner::new()),
            Arc::new(store),
        )
    }

    #[test]
    fn test_prepare_input_adds_deps_for_fan_in() {
        let mut context = ResolveContext::new(json!({"repo": "acme/app"}));
        context.set_step_output("b", json!({"n": 1}));
        context.set_step_output("c", json!({"n": 2}));
        let context = context.for_step(&["b".to_string(), "c".to_string()]);

        let step = StepSpec::new("d", "merger")
            .depends_on(["b", "c"])
            .with_inputs(json!({"repo": "${repo}"}));
        let options = ExecOptions::new("run-1").with_extra_input("attempt", json!(2));

        let input = prepare_input(&step, &context, &options);
        assert_eq!(
            input,
            json!({"repo": "acme/app", "deps": {"b": {"n": 1}, "c": {"n": 2}}, "attempt": 2})
        );
    }

    #[test]
    fn test_prepare_input_keeps_single_dependency_inputs() {
        let mut context = ResolveContext::new(json!({}));
        context.set_step_output("a", json!({"n": 1}));
        let step = StepSpec::new("b", "coder")
            .depends_on(["a"])
            .with_inputs(json!({"n": "${steps.a.n}", "attempt": 9}));
        let options = ExecOptions::new("run-1").with_extra_input("attempt", json!(1));

        let input = prepare_input(&step, &context.for_step(&["a".into()]), &options);
        assert_eq!(input, json!({"n": 1, "attempt": 9}));
    }

    #[tokio::test]
    async fn test_false_condition_skips_and_records() {
        let store = MemoryStore::new();
        let exec = executor(store.clone());
        let step = StepSpec::new("deploy", "deployer").with_condition("${trigger.ship} == yes");
        let context = ResolveContext::new(json!({"ship": "no"}));

        let outcome = exec
            .execute_step(&step, &context, &ExecOptions::new("run-1"))
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Skipped { .. }));

        let steps = store.steps().await;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepRecordStatus::Skipped);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_structural() {
        let exec = executor(MemoryStore::new());
        let err = exec
            .execute_step(
                &StepSpec::new("a", "ghost"),
                &ResolveContext::default(),
                &ExecOptions::new("run-1").without_records(),
            )
            .await
            .unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_read_output_errors() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join(OUTPUT_FILE);
        assert!(read_output(&path).unwrap_err().contains("no output.json"));
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_output(&path).unwrap_err().contains("malformed"));
        std::fs::write(&path, r#"{"ok": true}"#).unwrap();
        assert_eq!(read_output(&path).unwrap(), json!({"ok": true}));
    }
}
