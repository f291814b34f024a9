//! # swarm-engine
//!
//! Schedules agent work ("tickets") onto a bounded pool of isolated execution
//! environments, runs multi-step workflows in dependency order and gates
//! completion behind a bounded-retry verification loop.
//!
//! ## Usage
//!
//! ```bash
//! swarm-engine run --config swarm.toml [--tickets tickets.yaml] [-v]
//! swarm-engine plan workflow.yaml
//! swarm-engine lease list
//! ```
//!
//! ## Modules
//!
//! - `engine` - Scheduling loop, per-ticket retry state machine, sentinel review, shutdown drain
//! - `lease` - Slot lock files, environment driver contract and the lease pool
//! - `executor` - Runs one step locally or inside a leased environment
//! - `sequencer` - Workflow DAG planning and concurrent step dispatch
//! - `resolver` - `${...}` reference resolution and condition evaluation
//! - `verification` - Judge contract, feedback formatting, retry policy, PR merge
//! - `store` - Work store trait with in-memory and PostgreSQL implementations
//! - `agent` - Agent definitions and registry lookup
//! - `subprocess` - Unified subprocess abstraction layer for testing
//! - `app` - Settings, logging, pid file and engine wiring
//! - `testing` - Mock collaborators and fixtures
pub mod agent;
pub mod app;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lease;
pub mod resolver;
pub mod sequencer;
pub mod store;
pub mod subprocess;
pub mod verification;

pub mod testing;
