//! One attempt at a claimed ticket
//!
//! Executes the ticket (single agent or workflow), passes the result through
//! the verification gate and moves the ticket to its next state: done or
//! review on a pass, back to ready with feedback on a rejection, on hold once
//! retries are exhausted, cancelled on infrastructure failure.

use super::config::SentinelConfig;
use crate::executor::{ExecOptions, ExecutorError, StepExecutor, StepOutcome};
use crate::resolver::ResolveContext;
use crate::sequencer::{StepSpec, WorkflowRunner};
use crate::store::{StoreResult, Ticket, TicketEvent, TicketState, TicketUpdate, WorkStore};
use crate::verification::{
    feedback_record, instructions_from, rejection_from_failure, verify_with_retries, Judge,
    RetryDecision, VerificationConfig, VerificationRequest, VerificationResult,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Step id used when a ticket runs a single agent
pub const SINGLE_STEP_ID: &str = "main";

/// Where a ticket ended up after one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TicketDisposition {
    Done,
    InReview,
    Retry {
        retry_count: u32,
        after: DateTime<Utc>,
    },
    OnHold {
        reason: String,
    },
    Cancelled {
        reason: String,
    },
    /// No slot was free; back to `ready` without using a retry
    Requeued,
    /// Another writer moved the ticket first
    Superseded,
}

/// What the agent side of an attempt produced
enum Attempt {
    Completed(Value),
    Failed { error: String, evidence: Value },
}

/// Periodic `last_heartbeat` updates for as long as the guard lives
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(store: Arc<dyn WorkStore>, ticket_id: String, interval: Duration) -> Self {
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = store.heartbeat(&ticket_id).await {
                    warn!("Heartbeat for {} failed: {}", ticket_id, e);
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct TicketRunner {
    store: Arc<dyn WorkStore>,
    executor: Arc<StepExecutor>,
    judge: Option<Arc<dyn Judge>>,
    verification: VerificationConfig,
    sentinel: SentinelConfig,
    heartbeat_interval: Duration,
    max_parallel_steps: usize,
    pool_backoff: Duration,
    base_context: ResolveContext,
}

impl TicketRunner {
    pub fn new(
        store: Arc<dyn WorkStore>,
        executor: Arc<StepExecutor>,
        verification: VerificationConfig,
    ) -> Self {
        Self {
            store,
            executor,
            judge: None,
            verification,
            sentinel: SentinelConfig::default(),
            heartbeat_interval: Duration::from_secs(15),
            max_parallel_steps: 4,
            pool_backoff: Duration::from_secs(5),
            base_context: ResolveContext::default(),
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_sentinel(mut self, sentinel: SentinelConfig) -> Self {
        self.sentinel = sentinel;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_parallel_steps(mut self, max: usize) -> Self {
        self.max_parallel_steps = max.max(1);
        self
    }

    pub fn with_pool_backoff(mut self, backoff: Duration) -> Self {
        self.pool_backoff = backoff;
        self
    }

    /// Config, secrets and env layers shared by every ticket
    pub fn with_context(mut self, context: ResolveContext) -> Self {
        self.base_context = context;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    /// Work one claimed (`in_progress`) ticket to its next resting state
    pub async fn run(&self, ticket: Ticket) -> StoreResult<TicketDisposition> {
        let _heartbeat = Heartbeat::start(
            self.store.clone(),
            ticket.id.clone(),
            self.heartbeat_interval,
        );
        let attempt = ticket.retry_count + 1;
        info!(
            "Starting ticket {} attempt {}/{}",
            ticket.id, attempt, self.verification.retry.max_attempts
        );
        self.record(
            &ticket.id,
            "attempt_started",
            None,
            Some(TicketState::InProgress),
            json!({"attempt": attempt}),
        )
        .await;

        let attempt_result = self.execute(&ticket, attempt).await;
        match attempt_result {
            Err(e) => self.fail(&ticket, TicketState::InProgress, e).await,
            Ok(Attempt::Failed { error, evidence }) => {
                warn!("Ticket {} attempt {} failed: {}", ticket.id, attempt, error);
                let result = rejection_from_failure(&error, &evidence);
                self.reject(&ticket, TicketState::InProgress, attempt, &result, Some(evidence))
                    .await
            }
            Ok(Attempt::Completed(outputs)) => self.verify(&ticket, attempt, outputs).await,
        }
    }

    async fn execute(&self, ticket: &Ticket, attempt: u32) -> Result<Attempt, ExecutorError> {
        let mut context = self.base_context.clone();
        context.trigger = trigger_for(ticket);

        let mut options = ExecOptions::new(format!("{}-{}", ticket.id, attempt))
            .for_ticket(ticket.id.clone())
            .with_mode(self.executor.config().default_mode)
            .with_extra_input("ticket", ticket_metadata(ticket))
            .with_extra_input("attempt", json!(attempt));
        if let Some(feedback) = instructions_from(ticket.sentinel_feedback.as_ref()) {
            options = options.with_extra_input("feedback", Value::String(feedback));
        }

        match &ticket.workflow {
            Some(steps) if !steps.is_empty() => {
                let runner = WorkflowRunner::new(self.executor.clone(), self.max_parallel_steps);
                let summary = runner.run(steps, context, &options).await?;
                let record = match serde_json::to_value(&summary) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Could not serialize run {} for evidence: {}", summary.run_id, e);
                        Value::Null
                    }
                };
                if summary.succeeded {
                    Ok(Attempt::Completed(json!({
                        "run_id": summary.run_id,
                        "steps": summary.outputs,
                    })))
                } else {
                    let (step, error) = summary.first_failure().unwrap_or(("?", "failed"));
                    Ok(Attempt::Failed {
                        error: format!("step {} failed: {}", step, error),
                        evidence: record,
                    })
                }
            }
            _ => {
                let agent = ticket.assignee_id.clone().unwrap_or_default();
                let step = StepSpec::new(SINGLE_STEP_ID, agent).with_inputs(ticket.inputs.clone());
                let outcome = self
                    .executor
                    .execute_step(&step, &context, &options.without_records())
                    .await?;
                Ok(match outcome {
                    StepOutcome::Completed { outputs, .. } => Attempt::Completed(outputs),
                    StepOutcome::Failed { error, evidence } => Attempt::Failed { error, evidence },
                    StepOutcome::Skipped { reason } => {
                        Attempt::Completed(json!({"skipped": reason}))
                    }
                })
            }
        }
    }

    async fn verify(
        &self,
        ticket: &Ticket,
        attempt: u32,
        outputs: Value,
    ) -> StoreResult<TicketDisposition> {
        if !self
            .move_to(
                ticket,
                TicketState::InProgress,
                TicketState::Verifying,
                TicketUpdate::new().outputs(outputs.clone()),
                "verification_started",
                json!({"attempt": attempt}),
            )
            .await?
        {
            return Ok(TicketDisposition::Superseded);
        }

        let result = match (&ticket.branch_name, &self.judge) {
            (Some(branch), Some(judge)) => {
                let request = VerificationRequest {
                    ticket_id: ticket.id.clone(),
                    branch_name: branch.clone(),
                    repo_url: ticket.repo_url.clone(),
                    attempt,
                    acceptance_criteria: ticket.acceptance_criteria.clone(),
                    phases: self.verification.phases.clone(),
                };
                match verify_with_retries(
                    judge.as_ref(),
                    &request,
                    self.verification.judge_retries,
                    self.verification.judge_retry_delay,
                )
                .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        return self
                            .fail(ticket, TicketState::Verifying, ExecutorError::infrastructure(e))
                            .await
                    }
                }
            }
            (None, _) => {
                debug!("Ticket {} has no branch, skipping verification", ticket.id);
                VerificationResult::skipped()
            }
            (Some(_), None) => {
                debug!("No judge configured, skipping verification of {}", ticket.id);
                VerificationResult::skipped()
            }
        };

        if result.is_pass() {
            self.pass(ticket, &result, outputs).await
        } else {
            self.reject(ticket, TicketState::Verifying, attempt, &result, None)
                .await
        }
    }

    async fn pass(
        &self,
        ticket: &Ticket,
        result: &VerificationResult,
        outputs: Value,
    ) -> StoreResult<TicketDisposition> {
        let update = TicketUpdate::new()
            .clear_lease()
            .verification(result.status.as_str())
            .outputs(outputs);

        if self.sentinel.enabled {
            let moved = self
                .move_to(
                    ticket,
                    TicketState::Verifying,
                    TicketState::InReview,
                    update.assign(self.sentinel.agent_id.clone()),
                    "sent_to_review",
                    json!({"reviewer": self.sentinel.agent_id}),
                )
                .await?;
            if moved {
                info!("Ticket {} passed verification, queued for review", ticket.id);
                return Ok(TicketDisposition::InReview);
            }
            return Ok(TicketDisposition::Superseded);
        }

        let moved = self
            .move_to(
                ticket,
                TicketState::Verifying,
                TicketState::Done,
                update.completed(),
                "completed",
                json!({"verification_status": result.status}),
            )
            .await?;
        if moved {
            info!("Ticket {} done", ticket.id);
            Ok(TicketDisposition::Done)
        } else {
            Ok(TicketDisposition::Superseded)
        }
    }

    async fn reject(
        &self,
        ticket: &Ticket,
        from: TicketState,
        attempt: u32,
        result: &VerificationResult,
        evidence: Option<Value>,
    ) -> StoreResult<TicketDisposition> {
        let policy = &self.verification.retry;
        let feedback = feedback_record(result, attempt, policy.max_attempts);
        let mut update = TicketUpdate::new()
            .clear_lease()
            .verification(result.status.as_str())
            .feedback(feedback);
        if let Some(evidence) = evidence {
            update = update.evidence(evidence);
        }

        match policy.decide(ticket.retry_count, Utc::now()) {
            RetryDecision::Retry { retry_count, after } => {
                let moved = self
                    .move_to(
                        ticket,
                        from,
                        TicketState::Ready,
                        update.retry(retry_count, Some(after)),
                        "retry_scheduled",
                        json!({"retry_count": retry_count, "retry_after": after}),
                    )
                    .await?;
                if !moved {
                    return Ok(TicketDisposition::Superseded);
                }
                info!(
                    "Ticket {} rejected, retry {} scheduled after {}",
                    ticket.id, retry_count, after
                );
                Ok(TicketDisposition::Retry { retry_count, after })
            }
            RetryDecision::Hold { retry_count } => {
                let reason = format!(
                    "verification rejected {} of {} attempts",
                    retry_count, policy.max_attempts
                );
                let moved = self
                    .move_to(
                        ticket,
                        from,
                        TicketState::OnHold,
                        update.retry(retry_count, None).hold(reason.clone()),
                        "put_on_hold",
                        json!({"retry_count": retry_count, "reason": reason}),
                    )
                    .await?;
                if !moved {
                    return Ok(TicketDisposition::Superseded);
                }
                warn!("Ticket {} put on hold: {}", ticket.id, reason);
                Ok(TicketDisposition::OnHold { reason })
            }
        }
    }

    /// Structural errors hold the ticket for a human; infrastructure errors
    /// cancel it without consuming a retry. An exhausted pool only requeues.
    async fn fail(
        &self,
        ticket: &Ticket,
        from: TicketState,
        err: ExecutorError,
    ) -> StoreResult<TicketDisposition> {
        let structural = err.is_structural();
        let evidence = err.error().to_evidence();

        if from == TicketState::InProgress && err.error().is_retryable() {
            let until = Utc::now()
                + chrono::Duration::from_std(self.pool_backoff).unwrap_or(chrono::Duration::zero());
            info!("Ticket {} requeued until {}: {}", ticket.id, until, err);
            let moved = self
                .move_to(
                    ticket,
                    from,
                    TicketState::Ready,
                    TicketUpdate::new().clear_lease().defer(until),
                    "requeued",
                    evidence,
                )
                .await?;
            return Ok(if moved {
                TicketDisposition::Requeued
            } else {
                TicketDisposition::Superseded
            });
        }

        let update = TicketUpdate::new().clear_lease().evidence(evidence.clone());

        if structural {
            let reason = format!("structural error: {}", err);
            error!("Ticket {}: {}", ticket.id, reason);
            let moved = self
                .move_to(
                    ticket,
                    from,
                    TicketState::OnHold,
                    update.hold(reason.clone()),
                    "structural_error",
                    evidence,
                )
                .await?;
            return Ok(if moved {
                TicketDisposition::OnHold { reason }
            } else {
                TicketDisposition::Superseded
            });
        }

        let reason = format!("infrastructure error: {}", err);
        error!("Ticket {}: {}", ticket.id, reason);
        let moved = self
            .move_to(
                ticket,
                from,
                TicketState::Cancelled,
                update.hold(reason.clone()),
                "cancelled",
                evidence,
            )
            .await?;
        Ok(if moved {
            TicketDisposition::Cancelled { reason }
        } else {
            TicketDisposition::Superseded
        })
    }

    /// Conditional transition plus its event
    async fn move_to(
        &self,
        ticket: &Ticket,
        from: TicketState,
        to: TicketState,
        update: TicketUpdate,
        event_type: &str,
        data: Value,
    ) -> StoreResult<bool> {
        let moved = self.store.transition(&ticket.id, &[from], to, update).await?;
        if moved {
            self.record(&ticket.id, event_type, Some(from), Some(to), data)
                .await;
        } else {
            debug!(
                "Ticket {} left {} before the engine could move it to {}",
                ticket.id, from, to
            );
        }
        Ok(moved)
    }

    async fn record(
        &self,
        ticket_id: &str,
        event_type: &str,
        from: Option<TicketState>,
        to: Option<TicketState>,
        data: Value,
    ) {
        let event = TicketEvent::new(ticket_id, event_type, from, to, data);
        if let Err(e) = self.store.record_event(event).await {
            warn!("Failed to record {} event for {}: {}", event_type, ticket_id, e);
        }
    }
}

/// Ticket fields visible to the agent under `ticket`
fn ticket_metadata(ticket: &Ticket) -> Value {
    json!({
        "id": ticket.id,
        "title": ticket.title,
        "description": ticket.description,
        "acceptance_criteria": ticket.acceptance_criteria,
        "branch_name": ticket.branch_name,
        "repo_url": ticket.repo_url,
    })
}

/// Resolution root for a ticket: its inputs plus `ticket` metadata
fn trigger_for(ticket: &Ticket) -> Value {
    let mut trigger = match &ticket.inputs {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other.clone());
            map
        }
    };
    trigger
        .entry("ticket")
        .or_insert_with(|| ticket_metadata(ticket));
    Value::Object(trigger)
}
