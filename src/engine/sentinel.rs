//! Final review and merge of verified tickets

use super::config::SentinelConfig;
use crate::store::{StoreResult, Ticket, TicketEvent, TicketState, TicketUpdate, WorkStore};
use crate::verification::{
    feedback_record, format_feedback, verify_with_retries, Judge, PullRequestMerger,
    VerificationConfig, VerificationRequest, VerificationResult, SENTINEL_PHASE,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub const SENTINEL_REJECTED: &str = "sentinel_rejected";

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDisposition {
    Merged,
    NeedsReview { reason: String },
    Superseded,
}

pub struct SentinelReviewer {
    store: Arc<dyn WorkStore>,
    judge: Option<Arc<dyn Judge>>,
    merger: Arc<dyn PullRequestMerger>,
    verification: VerificationConfig,
    config: SentinelConfig,
}

impl SentinelReviewer {
    pub fn new(
        store: Arc<dyn WorkStore>,
        judge: Option<Arc<dyn Judge>>,
        merger: Arc<dyn PullRequestMerger>,
        verification: VerificationConfig,
        config: SentinelConfig,
    ) -> Self {
        Self {
            store,
            judge,
            merger,
            verification,
            config,
        }
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    /// Review one claimed (`reviewing`) ticket
    pub async fn review(&self, ticket: Ticket) -> StoreResult<ReviewDisposition> {
        let Some(pr_url) = ticket.pr_url.clone() else {
            return self
                .escalate(&ticket, "no pull request to review".to_string(), None)
                .await;
        };

        let Some(judge) = &self.judge else {
            return self
                .escalate(&ticket, "no judge configured for review".to_string(), None)
                .await;
        };

        let request = VerificationRequest {
            ticket_id: ticket.id.clone(),
            branch_name: ticket.branch_name.clone().unwrap_or_default(),
            repo_url: ticket.repo_url.clone(),
            attempt: ticket.retry_count + 1,
            acceptance_criteria: ticket.acceptance_criteria.clone(),
            phases: vec![SENTINEL_PHASE.to_string()],
        };
        let result = match verify_with_retries(
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
                    .escalate(&ticket, format!("sentinel review failed: {}", e), None)
                    .await
            }
        };

        if !result.is_pass() {
            let reason = format_feedback(&result, request.attempt, 1);
            return self.escalate(&ticket, reason, Some(&result)).await;
        }

        match self.merger.merge(&pr_url).await {
            Ok(outcome) => {
                let moved = self
                    .store
                    .transition(
                        &ticket.id,
                        &[TicketState::Reviewing],
                        TicketState::Done,
                        TicketUpdate::new()
                            .clear_lease()
                            .verification("merged")
                            .completed(),
                    )
                    .await?;
                if !moved {
                    return Ok(ReviewDisposition::Superseded);
                }
                info!("Ticket {} merged ({:?})", ticket.id, outcome);
                self.record(
                    &ticket.id,
                    "merged",
                    TicketState::Done,
                    json!({"pr_url": pr_url, "outcome": format!("{:?}", outcome)}),
                )
                .await;
                Ok(ReviewDisposition::Merged)
            }
            Err(e) => {
                self.escalate(&ticket, format!("merge failed: {}", e), Some(&result))
                    .await
            }
        }
    }

    /// Hand the ticket to a human
    async fn escalate(
        &self,
        ticket: &Ticket,
        reason: String,
        result: Option<&VerificationResult>,
    ) -> StoreResult<ReviewDisposition> {
        warn!("Ticket {} needs human review: {}", ticket.id, reason);
        let mut update = TicketUpdate::new()
            .clear_lease()
            .verification(SENTINEL_REJECTED)
            .hold(reason.clone());
        if let Some(result) = result {
            update = update.feedback(feedback_record(result, ticket.retry_count + 1, 1));
        }

        let moved = self
            .store
            .transition(
                &ticket.id,
                &[TicketState::Reviewing],
                TicketState::NeedsReview,
                update,
            )
            .await?;
        if !moved {
            return Ok(ReviewDisposition::Superseded);
        }
        self.record(
            &ticket.id,
            SENTINEL_REJECTED,
            TicketState::NeedsReview,
            json!({"reason": reason}),
        )
        .await;
        Ok(ReviewDisposition::NeedsReview { reason })
    }

    async fn record(&self, ticket_id: &str, event_type: &str, to: TicketState, data: Value) {
        let event = TicketEvent::new(
            ticket_id,
            event_type,
            Some(TicketState::Reviewing),
            Some(to),
            data,
        );
        if let Err(e) = self.store.record_event(event).await {
            warn!("Failed to record {} event for {}: {}", event_type, ticket_id, e);
        }
    }
}
