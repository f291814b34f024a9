//! Ticket model and store records

use crate::sequencer::StepSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Lease id recorded between claim and lease acquisition
pub const LEASE_PLACEHOLDER: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Draft,
    Blocked,
    Ready,
    InProgress,
    Verifying,
    InReview,
    Reviewing,
    NeedsReview,
    Done,
    OnHold,
    Cancelled,
}

impl TicketState {
    /// States in which a ticket may hold a slot
    pub const LEASED: [TicketState; 3] = [
        TicketState::InProgress,
        TicketState::Verifying,
        TicketState::Reviewing,
    ];

    pub const ALL: [TicketState; 11] = [
        TicketState::Draft,
        TicketState::Blocked,
        TicketState::Ready,
        TicketState::InProgress,
        TicketState::Verifying,
        TicketState::InReview,
        TicketState::Reviewing,
        TicketState::NeedsReview,
        TicketState::Done,
        TicketState::OnHold,
        TicketState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketState::Draft => "draft",
            TicketState::Blocked => "blocked",
            TicketState::Ready => "ready",
            TicketState::InProgress => "in_progress",
            TicketState::Verifying => "verifying",
            TicketState::InReview => "in_review",
            TicketState::Reviewing => "reviewing",
            TicketState::NeedsReview => "needs_review",
            TicketState::Done => "done",
            TicketState::OnHold => "on_hold",
            TicketState::Cancelled => "cancelled",
        }
    }

    /// No automatic transition leaves these states
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TicketState::Done | TicketState::Cancelled | TicketState::OnHold | TicketState::NeedsReview
        )
    }

    /// States in which a worker task owns the ticket
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TicketState::InProgress | TicketState::Verifying | TicketState::Reviewing
        )
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TicketState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown ticket state '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    Agent,
    Human,
}

impl AssigneeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssigneeType::Agent => "agent",
            AssigneeType::Human => "human",
        }
    }
}

impl FromStr for AssigneeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(AssigneeType::Agent),
            "human" => Ok(AssigneeType::Human),
            other => Err(format!("unknown assignee type '{}'", other)),
        }
    }
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub state: TicketState,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub assignee_type: Option<AssigneeType>,
    #[serde(default)]
    pub lease_id: Option<i64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verification_status: Option<String>,
    #[serde(default)]
    pub sentinel_feedback: Option<Value>,
    #[serde(default)]
    pub hold_reason: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    /// Present for multi-step tickets
    #[serde(default)]
    pub workflow: Option<Vec<StepSpec>>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub evidence: Option<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// A ready ticket assigned to `agent`
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: None,
            title: String::new(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            state: TicketState::Ready,
            depends_on: Vec::new(),
            assignee_id: Some(agent.into()),
            assignee_type: Some(AssigneeType::Agent),
            lease_id: None,
            retry_count: 0,
            retry_after: None,
            verification_status: None,
            sentinel_feedback: None,
            hold_reason: None,
            inputs: Value::Object(Default::default()),
            workflow: None,
            branch_name: None,
            repo_url: None,
            pr_url: None,
            outputs: None,
            evidence: None,
            created_at: now,
            updated_at: now,
            last_heartbeat: None,
            completed_at: None,
        }
    }

    /// Eligible for the scheduler to claim at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == TicketState::Ready
            && self.assignee_id.is_some()
            && self.assignee_type == Some(AssigneeType::Agent)
            && self.lease_id.is_none()
            && self.retry_after.map_or(true, |after| after <= now)
    }

    pub fn is_workflow(&self) -> bool {
        self.workflow.as_ref().is_some_and(|steps| !steps.is_empty())
    }
}

/// Field changes applied together with a state transition
///
/// `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketUpdate {
    pub lease_id: Option<Option<i64>>,
    pub assignee_id: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub retry_after: Option<Option<DateTime<Utc>>>,
    pub verification_status: Option<Option<String>>,
    pub sentinel_feedback: Option<Option<Value>>,
    pub hold_reason: Option<Option<String>>,
    pub outputs: Option<Value>,
    pub evidence: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TicketUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease(mut self, lease_id: Option<i64>) -> Self {
        self.lease_id = Some(lease_id);
        self
    }

    pub fn clear_lease(self) -> Self {
        self.lease(None)
    }

    pub fn assign(mut self, assignee_id: impl Into<String>) -> Self {
        self.assignee_id = Some(Some(assignee_id.into()));
        self
    }

    pub fn retry(mut self, retry_count: u32, retry_after: Option<DateTime<Utc>>) -> Self {
        self.retry_count = Some(retry_count);
        self.retry_after = Some(retry_after);
        self
    }

    /// Not claimable again before `until`
    pub fn defer(mut self, until: DateTime<Utc>) -> Self {
        self.retry_after = Some(Some(until));
        self
    }

    pub fn verification(mut self, status: impl Into<String>) -> Self {
        self.verification_status = Some(Some(status.into()));
        self
    }

    pub fn feedback(mut self, feedback: Value) -> Self {
        self.sentinel_feedback = Some(Some(feedback));
        self
    }

    pub fn hold(mut self, reason: impl Into<String>) -> Self {
        self.hold_reason = Some(Some(reason.into()));
        self
    }

    pub fn outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn evidence(mut self, evidence: Value) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn apply(&self, ticket: &mut Ticket) {
        if let Some(lease_id) = self.lease_id {
            ticket.lease_id = lease_id;
        }
        if let Some(assignee_id) = &self.assignee_id {
            ticket.assignee_id = assignee_id.clone();
        }
        if let Some(retry_count) = self.retry_count {
            ticket.retry_count = retry_count;
        }
        if let Some(retry_after) = self.retry_after {
            ticket.retry_after = retry_after;
        }
        if let Some(status) = &self.verification_status {
            ticket.verification_status = status.clone();
        }
        if let Some(feedback) = &self.sentinel_feedback {
            ticket.sentinel_feedback = feedback.clone();
        }
        if let Some(reason) = &self.hold_reason {
            ticket.hold_reason = reason.clone();
        }
        if let Some(outputs) = &self.outputs {
            ticket.outputs = Some(outputs.clone());
        }
        if let Some(evidence) = &self.evidence {
            ticket.evidence = Some(evidence.clone());
        }
        if let Some(completed_at) = self.completed_at {
            ticket.completed_at = Some(completed_at);
        }
        ticket.updated_at = Utc::now();
    }
}

/// Appended on every engine-driven state change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketEvent {
    pub ticket_id: String,
    pub event_type: String,
    pub from_state: Option<TicketState>,
    pub to_state: Option<TicketState>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl TicketEvent {
    pub fn new(
        ticket_id: impl Into<String>,
        event_type: impl Into<String>,
        from_state: Option<TicketState>,
        to_state: Option<TicketState>,
        data: Value,
    ) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            event_type: event_type.into(),
            from_state,
            to_state,
            data,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRecordStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepRecordStatus::Running => "running",
            StepRecordStatus::Completed => "completed",
            StepRecordStatus::Failed => "failed",
            StepRecordStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepExecutionRecord {
    pub id: uuid::Uuid,
    pub ticket_id: Option<String>,
    pub run_id: String,
    pub step_id: String,
    pub agent: String,
    pub status: StepRecordStatus,
    pub slot: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepExecutionRecord {
    pub fn start(
        ticket_id: Option<String>,
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            ticket_id,
            run_id: run_id.into(),
            step_id: step_id.into(),
            agent: agent.into(),
            status: StepRecordStatus::Running,
            slot: None,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn finish(mut self, status: StepRecordStatus, error: Option<String>) -> Self {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in TicketState::ALL {
            assert_eq!(state.as_str().parse::<TicketState>().unwrap(), state);
        }
        assert!("merged".parse::<TicketState>().is_err());
    }

    #[test]
    fn test_claimable_requires_agent_assignment_and_elapsed_backoff() {
        let now = Utc::now();
        let mut ticket = Ticket::new("T-1", "coder");
        assert!(ticket.is_claimable(now));

        ticket.retry_after = Some(now + Duration::seconds(30));
        assert!(!ticket.is_claimable(now));
        assert!(ticket.is_claimable(now + Duration::seconds(31)));

        ticket.retry_after = None;
        ticket.lease_id = Some(LEASE_PLACEHOLDER);
        assert!(!ticket.is_claimable(now));

        ticket.lease_id = None;
        ticket.assignee_type = Some(AssigneeType::Human);
        assert!(!ticket.is_claimable(now));
    }

    #[test]
    fn test_update_sets_and_clears_fields() {
        let mut ticket = Ticket::new("T-1", "coder");
        ticket.lease_id = Some(3);
        ticket.hold_reason = Some("old".into());

        TicketUpdate::new()
            .clear_lease()
            .retry(2, None)
            .feedback(json!({"summary": "tests fail"}))
            .apply(&mut ticket);

        assert_eq!(ticket.lease_id, None);
        assert_eq!(ticket.retry_count, 2);
        assert_eq!(ticket.sentinel_feedback, Some(json!({"summary": "tests fail"})));
        // untouched
        assert_eq!(ticket.hold_reason.as_deref(), Some("old"));
    }

    #[test]
    fn test_ticket_yaml_defaults() {
        let ticket: Ticket = serde_yaml::from_str(
            "id: T-9\nstate: blocked\ndepends_on: [T-1]\nassignee_id: coder\nassignee_type: agent\n",
        )
        .unwrap();
        assert_eq!(ticket.state, TicketState::Blocked);
        assert_eq!(ticket.retry_count, 0);
        assert!(!ticket.is_workflow());
    }
}
