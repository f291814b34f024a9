//! Wiring settings into a running engine

use crate::agent::{AgentRegistry, FileAgentRegistry};
use crate::app::config::EngineSettings;
use crate::engine::{Engine, SentinelReviewer, TicketRunner};
use crate::error::{ErrorCode, SwarmError};
use crate::executor::StepExecutor;
use crate::lease::{CommandDriver, LeasePool};
use crate::resolver::ResolveContext;
use crate::store::{MemoryStore, WorkStore};
use crate::subprocess::ProcessRunner;
use crate::verification::{GhMerger, HttpJudge, Judge};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Work store selected by the settings
///
/// A seed file wins, then the database URL; with neither the engine runs
/// against an empty in-memory store.
pub async fn open_store(settings: &EngineSettings) -> Result<Arc<dyn WorkStore>, SwarmError> {
    if let Some(path) = &settings.tickets {
        info!("Loading tickets from {}", path.display());
        return Ok(Arc::new(MemoryStore::from_seed_file(path)?));
    }
    if !settings.database.url.is_empty() {
        return connect_database(settings).await;
    }
    warn!("No database or ticket file configured, using an empty in-memory store");
    Ok(Arc::new(MemoryStore::new()))
}

#[cfg(feature = "postgres")]
async fn connect_database(settings: &EngineSettings) -> Result<Arc<dyn WorkStore>, SwarmError> {
    let store = crate::store::PgWorkStore::connect(&settings.database).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_database(_settings: &EngineSettings) -> Result<Arc<dyn WorkStore>, SwarmError> {
    Err(SwarmError::config_with_code(
        ErrorCode::CONFIG_INVALID_VALUE,
        "a database URL is configured but this build lacks the `postgres` feature",
    ))
}

pub fn build_pool(
    settings: &EngineSettings,
    runner: Arc<dyn ProcessRunner>,
) -> Result<Arc<LeasePool>, SwarmError> {
    let driver = CommandDriver::new(settings.lease.driver.clone(), runner);
    Ok(Arc::new(LeasePool::new(settings.lease.clone(), Arc::new(driver))?))
}

pub fn build_judge(settings: &EngineSettings) -> Result<Option<Arc<dyn Judge>>, SwarmError> {
    match &settings.verification.judge_url {
        Some(url) => {
            let judge = HttpJudge::new(url.clone(), settings.verification.judge_timeout)?;
            Ok(Some(Arc::new(judge)))
        }
        None => {
            info!("No judge URL configured; verification will be skipped");
            Ok(None)
        }
    }
}

/// Assemble an engine from its collaborators
pub fn build_engine(
    settings: &EngineSettings,
    store: Arc<dyn WorkStore>,
    registry: Arc<dyn AgentRegistry>,
    runner: Arc<dyn ProcessRunner>,
    pool: Arc<LeasePool>,
    judge: Option<Arc<dyn Judge>>,
) -> Engine {
    let executor = StepExecutor::new(
        settings.executor.clone(),
        registry,
        runner.clone(),
        store.clone(),
    )
    .with_pool(pool.clone());

    let context = ResolveContext::default()
        .with_config(settings.variables_json())
        .with_secrets(settings.secrets_from_env())
        .with_env(std::env::vars().collect());

    let mut tickets = TicketRunner::new(
        store.clone(),
        Arc::new(executor),
        settings.verification.clone(),
    )
    .with_sentinel(settings.engine.sentinel.clone())
    .with_heartbeat_interval(settings.engine.heartbeat_interval)
    .with_max_parallel_steps(settings.engine.max_parallel_steps)
    .with_pool_backoff(settings.engine.pool_backoff)
    .with_context(context);
    if let Some(judge) = &judge {
        tickets = tickets.with_judge(judge.clone());
    }

    let sentinel = &settings.engine.sentinel;
    let merger = GhMerger::new(runner)
        .with_timeout(sentinel.merge_timeout)
        .with_token(sentinel.github_token.clone());
    let reviewer = SentinelReviewer::new(
        store.clone(),
        judge,
        Arc::new(merger),
        settings.verification.clone(),
        sentinel.clone(),
    );

    Engine::new(settings.engine.clone(), store, tickets)
        .with_sentinel(reviewer)
        .with_pool(pool)
}

/// Production engine: real processes, agents from `agents_dir`
pub async fn initialize_app(settings: &EngineSettings) -> Result<Engine, SwarmError> {
    let runner = crate::subprocess::SubprocessManager::production().runner();
    let store = open_store(settings).await?;
    let registry = FileAgentRegistry::load(settings.agents_dir.clone())?;
    let pool = build_pool(settings, runner.clone())?;
    let judge = build_judge(settings)?;
    Ok(build_engine(
        settings,
        store,
        Arc::new(registry),
        runner,
        pool,
        judge,
    ))
}

/// Receiver that flips to `true` on SIGINT or SIGTERM
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            warn!("Failed to install SIGINT/SIGTERM handlers, falling back to Ctrl+C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(e) => {
            warn!("Failed to listen for Ctrl+C signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
