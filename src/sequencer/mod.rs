//! Multi-step workflows
//!
//! A workflow is a DAG of steps. [`build_plan`] rejects malformed graphs before
//! anything runs, [`WorkflowRun`] tracks per-step state and
//! [`WorkflowRunner`] dispatches ready steps through the step executor.

pub mod plan;
pub mod run;
pub mod runner;

pub use plan::{
    build_plan, load_workflow, ExecutionPlan, PlanGroup, SequencerError, StepSpec, WorkflowFile,
};
pub use run::{RunSummary, SkipReason, StepRun, StepState, StepSummary, WorkflowRun};
pub use runner::WorkflowRunner;
