//! Execution plans for multi-step workflows

use crate::agent::AgentRef;
use crate::executor::ExecutionMode;
use crate::resolver::validate_condition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SequencerError {
    #[error("Duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle detected at step '{step}'")]
    Cycle { step: String },

    #[error("Invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("Failed to load workflow {path}: {message}")]
    Load { path: PathBuf, message: String },
}

impl SequencerError {
    pub fn step(&self) -> Option<&str> {
        match self {
            SequencerError::DuplicateStep(step)
            | SequencerError::UnknownDependency { step, .. }
            | SequencerError::Cycle { step }
            | SequencerError::InvalidStep { step, .. } => Some(step),
            SequencerError::Load { .. } => None,
        }
    }
}

impl From<SequencerError> for crate::error::SwarmError {
    fn from(err: SequencerError) -> Self {
        use crate::error::ErrorCode;
        let code = match &err {
            SequencerError::DuplicateStep(_) => ErrorCode::WORKFLOW_DUPLICATE_STEP,
            SequencerError::UnknownDependency { .. } => ErrorCode::WORKFLOW_UNKNOWN_DEPENDENCY,
            SequencerError::Cycle { .. } => ErrorCode::WORKFLOW_CIRCULAR_DEPENDENCY,
            SequencerError::InvalidStep { .. } | SequencerError::Load { .. } => {
                ErrorCode::WORKFLOW_INVALID_STEP
            }
        };
        let step = err.step().map(str::to_string);
        crate::error::SwarmError::workflow_with_code(code, err.to_string(), step).with_source(err)
    }
}

/// One declared step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub id: String,
    /// Agent reference, `name` or `name@version`
    pub agent: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            depends_on: Vec::new(),
            inputs: Value::Null,
            condition: None,
            timeout: None,
            mode: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Workflow file layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<StepSpec>,
}

pub fn load_workflow(path: &Path) -> Result<WorkflowFile, SequencerError> {
    let load_err = |message: String| SequencerError::Load {
        path: path.to_path_buf(),
        message,
    };
    let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
    serde_yaml::from_str(&text).map_err(|e| load_err(e.to_string()))
}

/// Steps sharing one dependency set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanGroup {
    pub depends_on: Vec<String>,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    /// Every step once, prerequisites first
    pub order: Vec<String>,
    pub groups: Vec<PlanGroup>,
    #[serde(skip)]
    dependencies: HashMap<String, BTreeSet<String>>,
    #[serde(skip)]
    dependents: HashMap<String, BTreeSet<String>>,
}

impl ExecutionPlan {
    pub fn dependencies(&self, step: &str) -> impl Iterator<Item = &String> + '_ {
        self.dependencies.get(step).into_iter().flatten()
    }

    pub fn dependents(&self, step: &str) -> impl Iterator<Item = &String> + '_ {
        self.dependents.get(step).into_iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Validate the steps and compute their order and groups
///
/// Fails before anything runs on duplicate ids, unknown dependencies, cycles
/// and malformed steps.
pub fn build_plan(steps: &[StepSpec]) -> Result<ExecutionPlan, SequencerError> {
    let mut dependencies: HashMap<String, BTreeSet<String>> = HashMap::new();
    for step in steps {
        validate_step(step)?;
        if dependencies
            .insert(step.id.clone(), step.depends_on.iter().cloned().collect())
            .is_some()
        {
            return Err(SequencerError::DuplicateStep(step.id.clone()));
        }
    }

    let mut dependents: HashMap<String, BTreeSet<String>> = steps
        .iter()
        .map(|s| (s.id.clone(), BTreeSet::new()))
        .collect();
    for step in steps {
        for dep in &step.depends_on {
            match dependents.get_mut(dep) {
                Some(set) => {
                    set.insert(step.id.clone());
                }
                None => {
                    return Err(SequencerError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    })
                }
            }
        }
    }

    let order = topological_order(steps)?;
    let groups = group_by_dependencies(&order, &dependencies);

    Ok(ExecutionPlan {
        order,
        groups,
        dependencies,
        dependents,
    })
}

fn validate_step(step: &StepSpec) -> Result<(), SequencerError> {
    let invalid = |reason: String| SequencerError::InvalidStep {
        step: step.id.clone(),
        reason,
    };
    if step.id.trim().is_empty() {
        return Err(invalid("step id is empty".to_string()));
    }
    AgentRef::parse(&step.agent).map_err(|e| invalid(e.to_string()))?;
    if let Some(condition) = &step.condition {
        validate_condition(condition).map_err(|e| invalid(e.to_string()))?;
    }
    if step.timeout.is_some_and(|t| t.is_zero()) {
        return Err(invalid("timeout must be positive".to_string()));
    }
    Ok(())
}

/// Depth-first post-order over declared order; a back edge onto a step still
/// being visited is a cycle
fn topological_order(steps: &[StepSpec]) -> Result<Vec<String>, SequencerError> {
    let index: HashMap<&str, &StepSpec> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> =
        steps.iter().map(|s| (s.id.as_str(), Mark::Unvisited)).collect();
    let mut order = Vec::with_capacity(steps.len());

    fn visit<'a>(
        id: &'a str,
        index: &HashMap<&'a str, &'a StepSpec>,
        marks: &mut HashMap<&'a str, Mark>,
        order: &mut Vec<String>,
    ) -> Result<(), SequencerError> {
        match marks.get(id).copied() {
            Some(Mark::Visited) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(SequencerError::Cycle {
                    step: id.to_string(),
                })
            }
            _ => {}
        }
        marks.insert(id, Mark::Visiting);
        if let Some(step) = index.get(id) {
            for dep in &step.depends_on {
                visit(dep, index, marks, order)?;
            }
        }
        marks.insert(id, Mark::Visited);
        order.push(id.to_string());
        Ok(())
    }

    for step in steps {
        visit(&step.id, &index, &mut marks, &mut order)?;
    }
    Ok(order)
}

fn group_by_dependencies(
    order: &[String],
    dependencies: &HashMap<String, BTreeSet<String>>,
) -> Vec<PlanGroup> {
    let mut groups: Vec<PlanGroup> = Vec::new();
    let mut by_key: HashMap<Vec<String>, usize> = HashMap::new();

    for id in order {
        let key: Vec<String> = dependencies
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
        match by_key.get(&key) {
            Some(&idx) => groups[idx].steps.push(id.clone()),
            None => {
                by_key.insert(key.clone(), groups.len());
                groups.push(PlanGroup {
                    depends_on: key,
                    steps: vec![id.clone()],
                });
            }
        }
    }
    groups
}
