use super::error::StoreResult;
use super::types::{StepExecutionRecord, Ticket, TicketEvent, TicketState, TicketUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Ticket persistence
///
/// Every mutation is a single conditional update keyed on the ticket's
/// current state; a `false` return means another writer got there first.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Ready, agent-assigned, unleased tickets whose backoff has elapsed,
    /// oldest first
    async fn fetch_claimable(&self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Ticket>>;

    /// `ready → in_progress` with the lease placeholder, only if still ready
    /// and unleased
    async fn claim(&self, id: &str) -> StoreResult<bool>;

    /// Move `id` to `to` if it is currently in one of `from`
    async fn transition(
        &self,
        id: &str,
        from: &[TicketState],
        to: TicketState,
        update: TicketUpdate,
    ) -> StoreResult<bool>;

    async fn get(&self, id: &str) -> StoreResult<Option<Ticket>>;

    /// Record the slot a ticket's step holds, only while the ticket is in
    /// one of [`TicketState::LEASED`]
    async fn set_lease(&self, id: &str, slot: i64) -> StoreResult<bool>;

    /// Put the lease id back to the placeholder if it still names `slot`
    ///
    /// A sibling step that leased another slot since then keeps its id.
    async fn reset_lease(&self, id: &str, slot: i64) -> StoreResult<bool>;

    /// Slots held by the ticket's still-running step executions
    async fn running_slots(&self, ticket_id: &str) -> StoreResult<Vec<u32>>;

    /// Move blocked tickets whose dependencies are all done to ready
    async fn promote_unblocked(&self) -> StoreResult<Vec<String>>;

    async fn heartbeat(&self, id: &str) -> StoreResult<()>;

    /// `in_review` tickets assigned to the sentinel with no lease
    async fn fetch_review_candidates(
        &self,
        sentinel_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Ticket>>;

    /// `in_review → reviewing` with the lease placeholder
    async fn claim_review(&self, id: &str, sentinel_id: &str) -> StoreResult<bool>;

    async fn record_event(&self, event: TicketEvent) -> StoreResult<()>;

    /// Insert or update a step execution record by id
    async fn record_step(&self, record: &StepExecutionRecord) -> StoreResult<()>;
}
