//! Ready-made collaborators for engine-level tests

use super::{MockEnvironmentDriver, RecordingMerger, ScriptedJudge};
use crate::agent::{AgentDefinition, InMemoryAgentRegistry};
use crate::engine::{Engine, EngineConfig, SentinelReviewer, TicketRunner};
use crate::executor::{ExecutionMode, ExecutorConfig, StepExecutor};
use crate::lease::{LeaseConfig, LeasePool};
use crate::store::MemoryStore;
use crate::subprocess::TokioProcessRunner;
use crate::verification::{RetryPolicy, VerificationConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn agent_definition(name: &str, entry: &str, code_dir: impl Into<PathBuf>) -> AgentDefinition {
    AgentDefinition {
        name: name.to_string(),
        version: semver::Version::new(1, 0, 0),
        aliases: Vec::new(),
        runtime: None,
        entry: entry.to_string(),
        code_dir: code_dir.into(),
        timeout: Duration::from_secs(30),
        memory_mb: 512,
        capabilities: Vec::new(),
        input_schema: None,
        output_schema: None,
    }
}

/// Agent whose entry is `sh run.sh` with `script` as the body
pub fn shell_agent(dir: &Path, name: &str, script: &str) -> AgentDefinition {
    let code_dir = dir.join(name);
    std::fs::create_dir_all(&code_dir).expect("create agent dir");
    std::fs::write(code_dir.join("run.sh"), script).expect("write agent script");
    agent_definition(name, "sh run.sh", code_dir)
}

/// Engine wired to in-memory collaborators
///
/// Retries and pool requeues have no backoff and polling is fast so tests
/// can drive the engine cycle by cycle.
pub struct TestHarness {
    pub temp: TempDir,
    pub store: MemoryStore,
    pub registry: Arc<InMemoryAgentRegistry>,
    pub driver: MockEnvironmentDriver,
    pub judge: ScriptedJudge,
    pub merger: RecordingMerger,
    pub pool: Arc<LeasePool>,
    pub engine_config: EngineConfig,
    pub executor_config: ExecutorConfig,
    pub verification: VerificationConfig,
    pub use_judge: bool,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_driver(MockEnvironmentDriver::new())
    }

    pub fn with_driver(driver: MockEnvironmentDriver) -> Self {
        Self::with_lease_config(driver, |_| {})
    }

    pub fn with_lease_config(
        driver: MockEnvironmentDriver,
        adjust: impl FnOnce(&mut LeaseConfig),
    ) -> Self {
        let temp = TempDir::new().expect("harness temp dir");
        let mut lease = LeaseConfig {
            pool_size: 2,
            max_slot_index: 2,
            lock_dir: temp.path().join("locks"),
            probe_timeout: Duration::from_millis(200),
            probe_interval: Duration::from_millis(10),
            spawn_timeout: Duration::from_secs(1),
            ..LeaseConfig::default()
        };
        adjust(&mut lease);
        let pool = Arc::new(
            LeasePool::new(lease, Arc::new(driver.clone())).expect("lease pool for tests"),
        );

        let engine_config = EngineConfig {
            max_concurrent: 4,
            poll_interval: Duration::from_millis(10),
            max_poll_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(50),
            pool_backoff: Duration::ZERO,
            ..EngineConfig::default()
        };
        let executor_config = ExecutorConfig {
            default_mode: ExecutionMode::Leased,
            staging_dir: Some(temp.path().join("staging")),
            remote_root: "/work".to_string(),
            exec_grace: Duration::from_secs(1),
        };
        let verification = VerificationConfig {
            judge_url: None,
            judge_retries: 1,
            judge_retry_delay: Duration::from_millis(1),
            retry: RetryPolicy {
                base_delay: Duration::ZERO,
                ..RetryPolicy::default()
            },
            ..VerificationConfig::default()
        };

        Self {
            temp,
            store: MemoryStore::new(),
            registry: Arc::new(InMemoryAgentRegistry::new()),
            driver,
            judge: ScriptedJudge::new(),
            merger: RecordingMerger::new(),
            pool,
            engine_config,
            executor_config,
            verification,
            use_judge: true,
        }
    }

    /// Register an agent whose code lives in a fresh directory under the
    /// harness root
    pub fn agent(&self, name: &str) -> AgentDefinition {
        let code_dir = self.temp.path().join("agents").join(name);
        std::fs::create_dir_all(&code_dir).expect("create agent dir");
        std::fs::write(code_dir.join("main.sh"), "#!/bin/sh\n").expect("write agent entry");
        let definition = agent_definition(name, "sh main.sh", code_dir);
        self.register(definition.clone());
        definition
    }

    pub fn register(&self, definition: AgentDefinition) {
        self.registry
            .register(definition)
            .expect("valid agent definition");
    }

    pub fn executor(&self) -> StepExecutor {
        StepExecutor::new(
            self.executor_config.clone(),
            self.registry.clone(),
            Arc::new(TokioProcessRunner),
            Arc::new(self.store.clone()),
        )
        .with_pool(self.pool.clone())
    }

    pub fn ticket_runner(&self) -> TicketRunner {
        let mut runner = TicketRunner::new(
            Arc::new(self.store.clone()),
            Arc::new(self.executor()),
            self.verification.clone(),
        )
        .with_sentinel(self.engine_config.sentinel.clone())
        .with_heartbeat_interval(self.engine_config.heartbeat_interval)
        .with_max_parallel_steps(self.engine_config.max_parallel_steps)
        .with_pool_backoff(self.engine_config.pool_backoff);
        if self.use_judge {
            runner = runner.with_judge(Arc::new(self.judge.clone()));
        }
        runner
    }

    pub fn reviewer(&self) -> SentinelReviewer {
        SentinelReviewer::new(
            Arc::new(self.store.clone()),
            self.use_judge
                .then(|| Arc::new(self.judge.clone()) as Arc<dyn crate::verification::Judge>),
            Arc::new(self.merger.clone()),
            self.verification.clone(),
            self.engine_config.sentinel.clone(),
        )
    }

    pub fn engine(&self) -> Engine {
        Engine::new(
            self.engine_config.clone(),
            Arc::new(self.store.clone()),
            self.ticket_runner(),
        )
        .with_sentinel(self.reviewer())
        .with_pool(self.pool.clone())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll until nothing is running and a cycle dispatches nothing
pub async fn run_until_settled(engine: &mut Engine, max_cycles: usize) {
    for _ in 0..max_cycles {
        let report = engine.poll_once().await.expect("poll cycle");
        if !report.dispatched_any() && engine.active_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("engine did not settle within {} cycles", max_cycles);
}
