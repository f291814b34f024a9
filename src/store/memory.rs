//! In-memory work store for tests and local runs

use super::error::{StoreError, StoreResult};
use super::traits::WorkStore;
use super::types::{
    StepExecutionRecord, StepRecordStatus, Ticket, TicketEvent, TicketState, TicketUpdate,
    LEASE_PLACEHOLDER,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default, Clone)]
pub struct MemoryStore {
    tickets: Arc<RwLock<HashMap<String, Ticket>>>,
    events: Arc<RwLock<Vec<TicketEvent>>>,
    steps: Arc<RwLock<Vec<StepExecutionRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tickets(tickets: impl IntoIterator<Item = Ticket>) -> Self {
        let map = tickets.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            tickets: Arc::new(RwLock::new(map)),
            ..Self::default()
        }
    }

    /// Load tickets from a YAML list
    pub fn from_seed_file(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Seed(format!("{}: {}", path.display(), e)))?;
        let tickets: Vec<Ticket> = serde_yaml::from_str(&text)
            .map_err(|e| StoreError::Seed(format!("{}: {}", path.display(), e)))?;
        Ok(Self::with_tickets(tickets))
    }

    pub async fn insert(&self, ticket: Ticket) {
        self.tickets.write().await.insert(ticket.id.clone(), ticket);
    }

    pub async fn all(&self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self.tickets.read().await.values().cloned().collect();
        tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tickets
    }

    pub async fn events(&self, ticket_id: &str) -> Vec<TicketEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.ticket_id == ticket_id)
            .cloned()
            .collect()
    }

    pub async fn steps(&self) -> Vec<StepExecutionRecord> {
        self.steps.read().await.clone()
    }

    /// Conditional update under the write lock
    async fn update_if<F>(&self, id: &str, guard: F, apply: impl FnOnce(&mut Ticket)) -> bool
    where
        F: FnOnce(&Ticket) -> bool,
    {
        let mut tickets = self.tickets.write().await;
        match tickets.get_mut(id) {
            Some(ticket) if guard(ticket) => {
                apply(ticket);
                ticket.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl WorkStore for MemoryStore {
    async fn fetch_claimable(&self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Ticket>> {
        let tickets = self.tickets.read().await;
        let mut claimable: Vec<Ticket> = tickets
            .values()
            .filter(|t| t.is_claimable(now))
            .cloned()
            .collect();
        claimable.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        claimable.truncate(limit);
        Ok(claimable)
    }

    async fn claim(&self, id: &str) -> StoreResult<bool> {
        Ok(self
            .update_if(
                id,
                |t| t.state == TicketState::Ready && t.lease_id.is_none(),
                |t| {
                    t.state = TicketState::InProgress;
                    t.lease_id = Some(LEASE_PLACEHOLDER);
                },
            )
            .await)
    }

    async fn transition(
        &self,
        id: &str,
        from: &[TicketState],
        to: TicketState,
        update: TicketUpdate,
    ) -> StoreResult<bool> {
        let moved = self
            .update_if(
                id,
                |t| from.contains(&t.state),
                |t| {
                    t.state = to;
                    update.apply(t);
                },
            )
            .await;
        if !moved {
            debug!("Transition of {} to {} skipped: state changed", id, to);
        }
        Ok(moved)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Ticket>> {
        Ok(self.tickets.read().await.get(id).cloned())
    }

    async fn set_lease(&self, id: &str, slot: i64) -> StoreResult<bool> {
        Ok(self
            .update_if(
                id,
                |t| TicketState::LEASED.contains(&t.state),
                |t| t.lease_id = Some(slot),
            )
            .await)
    }

    async fn reset_lease(&self, id: &str, slot: i64) -> StoreResult<bool> {
        Ok(self
            .update_if(
                id,
                |t| TicketState::LEASED.contains(&t.state) && t.lease_id == Some(slot),
                |t| t.lease_id = Some(LEASE_PLACEHOLDER),
            )
            .await)
    }

    async fn running_slots(&self, ticket_id: &str) -> StoreResult<Vec<u32>> {
        let steps = self.steps.read().await;
        let mut slots: Vec<u32> = steps
            .iter()
            .filter(|r| {
                r.ticket_id.as_deref() == Some(ticket_id) && r.status == StepRecordStatus::Running
            })
            .filter_map(|r| r.slot)
            .collect();
        slots.sort_unstable();
        slots.dedup();
        Ok(slots)
    }

    async fn promote_unblocked(&self) -> StoreResult<Vec<String>> {
        let mut tickets = self.tickets.write().await;
        let done: Vec<String> = tickets
            .values()
            .filter(|t| t.state == TicketState::Done)
            .map(|t| t.id.clone())
            .collect();

        let mut promoted = Vec::new();
        for ticket in tickets.values_mut() {
            if ticket.state == TicketState::Blocked
                && ticket.depends_on.iter().all(|dep| done.contains(dep))
            {
                ticket.state = TicketState::Ready;
                ticket.updated_at = Utc::now();
                promoted.push(ticket.id.clone());
            }
        }
        promoted.sort();
        Ok(promoted)
    }

    async fn heartbeat(&self, id: &str) -> StoreResult<()> {
        self.update_if(id, |t| t.state.is_active(), |t| {
            t.last_heartbeat = Some(Utc::now())
        })
        .await;
        Ok(())
    }

    async fn fetch_review_candidates(
        &self,
        sentinel_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Ticket>> {
        let tickets = self.tickets.read().await;
        let mut candidates: Vec<Ticket> = tickets
            .values()
            .filter(|t| {
                t.state == TicketState::InReview
                    && t.assignee_id.as_deref() == Some(sentinel_id)
                    && t.lease_id.is_none()
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn claim_review(&self, id: &str, sentinel_id: &str) -> StoreResult<bool> {
        Ok(self
            .update_if(
                id,
                |t| {
                    t.state == TicketState::InReview
                        && t.assignee_id.as_deref() == Some(sentinel_id)
                        && t.lease_id.is_none()
                },
                |t| {
                    t.state = TicketState::Reviewing;
                    t.lease_id = Some(LEASE_PLACEHOLDER);
                },
            )
            .await)
    }

    async fn record_event(&self, event: TicketEvent) -> StoreResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn record_step(&self, record: &StepExecutionRecord) -> StoreResult<()> {
        let mut steps = self.steps.write().await;
        match steps.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => steps.push(record.clone()),
        }
        Ok(())
    }
}
