//! Live state of one workflow run

use super::plan::ExecutionPlan;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Skipped
        )
    }
}

/// Why a step was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    Condition(String),
    /// A prerequisite failed or was itself skipped for that reason
    Upstream(String),
}

impl SkipReason {
    /// Whether dependents may still run
    fn unblocks_dependents(&self) -> bool {
        matches!(self, SkipReason::Condition(_))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepRun {
    pub state: StepState,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub skip_reason: Option<SkipReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub id: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub succeeded: bool,
    pub steps: Vec<StepSummary>,
    /// Outputs of completed steps keyed by step id
    pub outputs: Map<String, Value>,
}

impl RunSummary {
    /// First failed step and its error
    pub fn first_failure(&self) -> Option<(&str, &str)> {
        self.steps.iter().find_map(|s| match (s.state, &s.error) {
            (StepState::Failed, Some(error)) => Some((s.id.as_str(), error.as_str())),
            (StepState::Failed, None) => Some((s.id.as_str(), "failed")),
            _ => None,
        })
    }
}

pub struct WorkflowRun {
    id: String,
    plan: ExecutionPlan,
    steps: HashMap<String, StepRun>,
}

impl WorkflowRun {
    pub fn new(id: impl Into<String>, plan: ExecutionPlan) -> Self {
        let steps = plan
            .order
            .iter()
            .map(|id| (id.clone(), StepRun::default()))
            .collect();
        Self {
            id: id.into(),
            plan,
            steps,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn state(&self, step: &str) -> Option<StepState> {
        self.steps.get(step).map(|run| run.state)
    }

    pub fn step(&self, step: &str) -> Option<&StepRun> {
        self.steps.get(step)
    }

    /// Pending steps whose prerequisites are settled, in plan order
    ///
    /// Returned steps move to `ready`. Steps with a failed prerequisite are
    /// skipped here, which can cascade through the rest of the plan.
    pub fn take_ready(&mut self) -> Vec<String> {
        let mut ready = Vec::new();
        let order = self.plan.order.clone();
        for id in &order {
            if self.state(id) != Some(StepState::Pending) {
                continue;
            }
            let mut blocked_by = None;
            let mut waiting = false;
            for dep in self.plan.dependencies(id) {
                let dep_run = &self.steps[dep];
                match dep_run.state {
                    StepState::Completed => {}
                    StepState::Skipped
                        if dep_run
                            .skip_reason
                            .as_ref()
                            .map_or(true, SkipReason::unblocks_dependents) => {}
                    StepState::Failed | StepState::Skipped => {
                        blocked_by = Some(dep.clone());
                        break;
                    }
                    _ => waiting = true,
                }
            }
            match blocked_by {
                Some(dep) => {
                    let reason = format!("dependency '{}' did not succeed", dep);
                    self.mark_skipped(id, SkipReason::Upstream(reason));
                }
                None if !waiting => {
                    if let Some(run) = self.steps.get_mut(id) {
                        run.state = StepState::Ready;
                    }
                    ready.push(id.clone());
                }
                None => {}
            }
        }
        ready
    }

    pub fn mark_running(&mut self, step: &str, inputs: Option<Value>) {
        if let Some(run) = self.steps.get_mut(step) {
            run.state = StepState::Running;
            run.inputs = inputs;
            run.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self, step: &str, outputs: Value) {
        if let Some(run) = self.steps.get_mut(step) {
            run.state = StepState::Completed;
            run.outputs = Some(outputs);
            run.finished_at = Some(Utc::now());
        }
    }

    pub fn mark_failed(&mut self, step: &str, error: impl Into<String>) {
        if let Some(run) = self.steps.get_mut(step) {
            run.state = StepState::Failed;
            run.error = Some(error.into());
            run.finished_at = Some(Utc::now());
        }
    }

    pub fn mark_skipped(&mut self, step: &str, reason: SkipReason) {
        if let Some(run) = self.steps.get_mut(step) {
            run.state = StepState::Skipped;
            run.skip_reason = Some(reason);
            run.finished_at = Some(Utc::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.steps.values().all(|run| run.state.is_terminal())
    }

    pub fn has_failures(&self) -> bool {
        self.steps
            .values()
            .any(|run| run.state == StepState::Failed)
    }

    pub fn summary(&self) -> RunSummary {
        let steps = self
            .plan
            .order
            .iter()
            .map(|id| {
                let run = &self.steps[id];
                StepSummary {
                    id: id.clone(),
                    state: run.state,
                    error: run.error.clone(),
                    skip_reason: run.skip_reason.clone(),
                }
            })
            .collect();
        let outputs = self
            .plan
            .order
            .iter()
            .filter_map(|id| {
                let run = &self.steps[id];
                run.outputs.clone().map(|out| (id.clone(), out))
            })
            .collect();
        RunSummary {
            run_id: self.id.clone(),
            succeeded: self.is_finished() && !self.has_failures(),
            steps,
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::plan::{build_plan, StepSpec};
    use super::*;
    use serde_json::json;

    fn run(steps: &[(&str, &[&str])]) -> WorkflowRun {
        let specs: Vec<StepSpec> = steps
            .iter()
            .map(|(id, deps)| StepSpec::new(*id, "coder").depends_on(deps.iter().copied()))
            .collect();
        WorkflowRun::new("run-1", build_plan(&specs).unwrap())
    }

    #[test]
    fn test_ready_follows_dependencies() {
        let mut run = run(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        assert_eq!(run.take_ready(), vec!["a"]);
        assert!(run.take_ready().is_empty());

        run.mark_running("a", None);
        run.mark_completed("a", json!({"x": 1}));
        assert_eq!(run.take_ready(), vec!["b", "c"]);

        run.mark_completed("b", json!({}));
        assert!(run.take_ready().is_empty());
        run.mark_skipped("c", SkipReason::Condition("off".into()));
        assert_eq!(run.take_ready(), vec!["d"]);
    }

    #[test]
    fn test_failure_skips_dependents_transitively() {
        let mut run = run(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("side", &[])]);
        assert_eq!(run.take_ready(), vec!["a", "side"]);
        run.mark_failed("a", "boom");
        run.mark_completed("side", json!({"ok": true}));

        assert!(run.take_ready().is_empty());
        assert_eq!(run.state("b"), Some(StepState::Skipped));
        assert_eq!(run.state("c"), Some(StepState::Skipped));
        assert!(run.is_finished());

        let summary = run.summary();
        assert!(!summary.succeeded);
        assert_eq!(summary.first_failure(), Some(("a", "boom")));
        assert_eq!(summary.outputs.len(), 1);
        assert!(matches!(
            summary.steps[1].skip_reason,
            Some(SkipReason::Upstream(_))
        ));
    }

    #[test]
    fn test_summary_of_successful_run() {
        let mut run = run(&[("a", &[])]);
        run.take_ready();
        run.mark_completed("a", json!({"v": 1}));
        let summary = run.summary();
        assert!(summary.succeeded);
        assert_eq!(summary.outputs["a"], json!({"v": 1}));
    }
}
