//! Drives a workflow run through the step executor

use super::plan::{build_plan, StepSpec};
use super::run::{RunSummary, SkipReason, WorkflowRun};
use crate::executor::{prepare_input, ExecOptions, ExecutorError, StepExecutor, StepOutcome};
use crate::resolver::ResolveContext;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

pub struct WorkflowRunner {
    executor: Arc<StepExecutor>,
    max_parallel_steps: usize,
}

impl WorkflowRunner {
    pub fn new(executor: Arc<StepExecutor>, max_parallel_steps: usize) -> Self {
        Self {
            executor,
            max_parallel_steps: max_parallel_steps.max(1),
        }
    }

    /// Run every step of the workflow
    ///
    /// Step failures end up in the summary. An executor error aborts the run;
    /// steps still in flight are dropped, which releases their leases.
    pub async fn run(
        &self,
        steps: &[StepSpec],
        context: ResolveContext,
        options: &ExecOptions,
    ) -> Result<RunSummary, ExecutorError> {
        let plan = build_plan(steps)?;
        self.executor.check_agents(steps).await?;
        let specs: HashMap<&str, &StepSpec> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut run = WorkflowRun::new(options.run_id.clone(), plan);
        let mut context = context;
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut in_flight = FuturesUnordered::new();

        info!(
            "Starting workflow run {} ({} steps, {} groups)",
            run.id(),
            run.plan().len(),
            run.plan().groups.len()
        );

        loop {
            queue.extend(run.take_ready());
            while in_flight.len() < self.max_parallel_steps {
                let Some(id) = queue.pop_front() else {
                    break;
                };
                let spec = specs[id.as_str()];
                let step_context = context.for_step(&spec.depends_on);
                run.mark_running(&id, Some(prepare_input(spec, &step_context, options)));
                debug!("Dispatching step {}", id);
                in_flight.push(self.dispatch(spec, step_context, options));
            }

            let Some((id, result)) = in_flight.next().await else {
                break;
            };
            match result? {
                StepOutcome::Completed { outputs, .. } => {
                    context.set_step_output(&id, outputs.clone());
                    run.mark_completed(&id, outputs);
                }
                StepOutcome::Failed { error, .. } => run.mark_failed(&id, error),
                StepOutcome::Skipped { reason } => {
                    run.mark_skipped(&id, SkipReason::Condition(reason))
                }
            }
        }

        let summary = run.summary();
        info!(
            "Workflow run {} finished: {}",
            summary.run_id,
            if summary.succeeded { "succeeded" } else { "failed" }
        );
        Ok(summary)
    }

    async fn dispatch(
        &self,
        spec: &StepSpec,
        context: ResolveContext,
        options: &ExecOptions,
    ) -> (String, Result<StepOutcome, ExecutorError>) {
        let result = self.executor.execute_step(spec, &context, options).await;
        (spec.id.clone(), result)
    }
}
