use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm_engine::agent::FileAgentRegistry;
use swarm_engine::app::{
    build_engine, build_judge, build_pool, handle_fatal_error, init_logging, initialize_app,
    shutdown_signal, AppConfig, EngineSettings, PidFile,
};
use swarm_engine::error::SwarmError;
use swarm_engine::lease::{LeasePool, SlotState};
use swarm_engine::sequencer::{build_plan, load_workflow};
use swarm_engine::store::MemoryStore;
use swarm_engine::subprocess::SubprocessManager;
use tracing::info;

/// Run agent tickets across a pool of leased execution environments
#[derive(Parser)]
#[command(name = "swarm-engine")]
#[command(about = "Ticket scheduling engine for agent work in leased environments", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the TOML settings file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduling loop
    Run {
        /// YAML ticket list to run against an in-memory store
        #[arg(long)]
        tickets: Option<PathBuf>,

        /// Stop once there is nothing left to dispatch instead of polling forever
        #[arg(long)]
        once: bool,
    },
    /// Validate a workflow file and print its execution order
    Plan {
        /// Workflow YAML file
        workflow: PathBuf,
    },
    /// Inspect and repair slot locks
    Lease {
        #[command(subcommand)]
        command: LeaseCommands,
    },
}

#[derive(Subcommand)]
enum LeaseCommands {
    /// Show every slot and its holder
    List,
    /// Remove a slot's lock
    Release {
        slot: u32,
        /// Remove the lock even if its holder is still alive
        #[arg(long)]
        force: bool,
    },
    /// Remove locks whose holder process is gone
    Reclaim,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { tickets, once } => {
            run_engine(cli.config.as_deref(), tickets, once, cli.verbose).await
        }
        Commands::Plan { workflow } => {
            init_cli_logging(cli.verbose);
            run_plan(&workflow)
        }
        Commands::Lease { command } => {
            init_cli_logging(cli.verbose);
            run_lease_command(cli.config.as_deref(), command)
        }
    };

    if let Err(e) = result {
        handle_fatal_error(e, cli.verbose);
    }
}

fn init_cli_logging(verbose: u8) {
    if let Err(e) = init_logging(&AppConfig::new(verbose)) {
        eprintln!("Warning: {}", e);
    }
}

fn load_settings(config: Option<&Path>) -> anyhow::Result<EngineSettings> {
    EngineSettings::load(config).context("failed to load settings")
}

async fn run_engine(
    config: Option<&Path>,
    tickets: Option<PathBuf>,
    once: bool,
    verbose: u8,
) -> anyhow::Result<()> {
    let mut settings = load_settings(config)?;
    if tickets.is_some() {
        settings.tickets = tickets;
    }
    init_logging(&AppConfig::new(verbose).with_log_dir(settings.log_dir.clone()))?;

    let _pid_file = match &settings.pid_file {
        Some(path) => Some(PidFile::acquire(path)?),
        None => None,
    };

    let (mut engine, seeded) = match &settings.tickets {
        Some(path) => {
            let store = MemoryStore::from_seed_file(path).map_err(SwarmError::from)?;
            let runner = SubprocessManager::production().runner();
            let registry = FileAgentRegistry::load(settings.agents_dir.clone())
                .map_err(SwarmError::from)
                .with_context(|| format!("loading agents from {}", settings.agents_dir.display()))?;
            let pool = build_pool(&settings, runner.clone())?;
            let judge = build_judge(&settings)?;
            let engine = build_engine(
                &settings,
                Arc::new(store.clone()),
                Arc::new(registry),
                runner,
                pool,
                judge,
            );
            (engine, Some(store))
        }
        None => (initialize_app(&settings).await?, None),
    };

    if once {
        engine.run_until_idle().await?;
        info!("Nothing left to dispatch");
    } else {
        let report = engine.run(shutdown_signal()).await;
        if !report.is_clean() {
            info!("Cancelled on shutdown: {}", report.cancelled.join(", "));
        }
    }

    if let Some(store) = seeded {
        for ticket in store.all().await {
            println!("{}\t{}", ticket.id, ticket.state);
        }
    }
    Ok(())
}

fn run_plan(path: &Path) -> anyhow::Result<()> {
    let workflow = load_workflow(path).map_err(SwarmError::from)?;
    let plan = build_plan(&workflow.steps).map_err(SwarmError::from)?;

    println!(
        "Workflow: {}",
        workflow.name.as_deref().unwrap_or("(unnamed)")
    );
    println!("Order: {}", plan.order.join(" -> "));
    for (i, group) in plan.groups.iter().enumerate() {
        let after = if group.depends_on.is_empty() {
            "start".to_string()
        } else {
            group.depends_on.join(", ")
        };
        println!("  group {} (after {}): {}", i + 1, after, group.steps.join(", "));
    }
    Ok(())
}

fn lease_pool(config: Option<&Path>) -> anyhow::Result<Arc<LeasePool>> {
    let settings = load_settings(config)?;
    Ok(build_pool(&settings, SubprocessManager::production().runner())?)
}

fn run_lease_command(config: Option<&Path>, command: LeaseCommands) -> anyhow::Result<()> {
    let pool = lease_pool(config)?;
    match command {
        LeaseCommands::List => {
            for status in pool.status()? {
                match status.state {
                    SlotState::Free => println!("slot {}\tfree", status.slot),
                    SlotState::Unhealthy => println!("slot {}\tunhealthy", status.slot),
                    SlotState::Held(lock) => println!(
                        "slot {}\theld\tpid {} on {} since {}{}",
                        status.slot,
                        lock.process_id,
                        lock.hostname,
                        lock.acquired_at.to_rfc3339(),
                        if lock.is_stale() { " (stale)" } else { "" }
                    ),
                }
            }
        }
        LeaseCommands::Release { slot, force } => {
            let held = pool
                .status()?
                .into_iter()
                .find(|s| s.slot == slot)
                .ok_or_else(|| anyhow::anyhow!("slot {} is outside the pool", slot))?;
            match held.state {
                SlotState::Held(lock) if !force && !lock.is_stale() => {
                    anyhow::bail!(
                        "slot {} is held by live pid {} on {}; pass --force to remove it",
                        slot,
                        lock.process_id,
                        lock.hostname
                    );
                }
                SlotState::Held(_) => {
                    pool.force_release(slot)?;
                    println!("Released slot {}", slot);
                }
                _ => println!("Slot {} is not held", slot),
            }
        }
        LeaseCommands::Reclaim => {
            let slots = pool.reclaim_stale()?;
            if slots.is_empty() {
                println!("No stale locks");
            } else {
                for slot in slots {
                    println!("Reclaimed slot {}", slot);
                }
            }
        }
    }
    Ok(())
}
