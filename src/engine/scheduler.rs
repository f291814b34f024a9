use super::config::{EngineConfig, PollBackoff};
use super::sentinel::SentinelReviewer;
use super::shutdown::ShutdownReport;
use super::ticket_runner::TicketRunner;
use crate::lease::LeasePool;
use crate::store::{
    StoreResult, Ticket, TicketEvent, TicketState, TicketUpdate, WorkStore, LEASE_PLACEHOLDER,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What one scheduling cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    pub promoted: Vec<String>,
    pub dispatched: Vec<String>,
    pub reviews: Vec<String>,
    /// Claims lost to another engine
    pub lost: usize,
}

impl PollReport {
    pub fn dispatched_any(&self) -> bool {
        !self.dispatched.is_empty() || !self.reviews.is_empty()
    }
}

/// The scheduling loop
///
/// Claims eligible tickets up to `max_concurrent`, runs each in its own task
/// and keeps track of the tasks until they finish or the engine shuts down.
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) store: Arc<dyn WorkStore>,
    tickets: Arc<TicketRunner>,
    sentinel: Option<Arc<SentinelReviewer>>,
    pub(super) pool: Option<Arc<LeasePool>>,
    pub(super) active: HashMap<String, JoinHandle<()>>,
    backoff: PollBackoff,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn WorkStore>, tickets: TicketRunner) -> Self {
        let backoff = PollBackoff::from_config(&config);
        Self {
            config,
            store,
            tickets: Arc::new(tickets),
            sentinel: None,
            pool: None,
            active: HashMap::new(),
            backoff,
        }
    }

    /// Enables the review pass when the sentinel is enabled in the config
    pub fn with_sentinel(mut self, reviewer: SentinelReviewer) -> Self {
        if self.config.sentinel.enabled {
            self.sentinel = Some(Arc::new(reviewer));
        }
        self
    }

    /// Pool whose leases are force-released on shutdown
    pub fn with_pool(mut self, pool: Arc<LeasePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// One scheduling cycle
    pub async fn poll_once(&mut self) -> StoreResult<PollReport> {
        self.reap().await;
        let mut report = PollReport::default();

        report.promoted = self.store.promote_unblocked().await?;
        for id in &report.promoted {
            info!("Ticket {} unblocked", id);
            self.record(id, "unblocked", TicketState::Blocked, TicketState::Ready)
                .await;
        }

        let available = self.config.max_concurrent.saturating_sub(self.active.len());
        if available > 0 {
            let candidates = self.store.fetch_claimable(available, Utc::now()).await?;
            for mut ticket in candidates {
                if self.active.contains_key(&ticket.id) {
                    continue;
                }
                if !self.store.claim(&ticket.id).await? {
                    debug!("Lost claim on {} to another worker", ticket.id);
                    report.lost += 1;
                    continue;
                }
                self.record(&ticket.id, "claimed", TicketState::Ready, TicketState::InProgress)
                    .await;
                ticket.state = TicketState::InProgress;
                ticket.lease_id = Some(LEASE_PLACEHOLDER);
                report.dispatched.push(ticket.id.clone());
                self.spawn_ticket(ticket);
            }
        } else {
            debug!("At capacity ({} active)", self.active.len());
        }

        if let Some(sentinel) = self.sentinel.clone() {
            report.reviews = self.review_pass(&sentinel).await?;
        }

        if report.dispatched_any() {
            info!(
                "Dispatched {} ticket(s) and {} review(s), {} active",
                report.dispatched.len(),
                report.reviews.len(),
                self.active.len()
            );
        }
        Ok(report)
    }

    async fn review_pass(&mut self, sentinel: &Arc<SentinelReviewer>) -> StoreResult<Vec<String>> {
        let limit = self
            .config
            .max_concurrent
            .saturating_sub(self.active.len())
            .max(1);
        let agent_id = sentinel.config().agent_id.clone();
        let candidates = self.store.fetch_review_candidates(&agent_id, limit).await?;

        let mut claimed = Vec::new();
        for mut ticket in candidates {
            if self.active.contains_key(&ticket.id) {
                continue;
            }
            if !self.store.claim_review(&ticket.id, &agent_id).await? {
                debug!("Lost review claim on {}", ticket.id);
                continue;
            }
            self.record(&ticket.id, "review_claimed", TicketState::InReview, TicketState::Reviewing)
                .await;
            ticket.state = TicketState::Reviewing;
            ticket.lease_id = Some(LEASE_PLACEHOLDER);
            claimed.push(ticket.id.clone());

            let reviewer = sentinel.clone();
            let id = ticket.id.clone();
            let handle = tokio::spawn(async move {
                let id = ticket.id.clone();
                match reviewer.review(ticket).await {
                    Ok(disposition) => debug!("Review of {} finished: {:?}", id, disposition),
                    Err(e) => error!("Review of {} lost its store: {}", id, e),
                }
            });
            self.active.insert(id, handle);
        }
        Ok(claimed)
    }

    fn spawn_ticket(&mut self, ticket: Ticket) {
        let runner = self.tickets.clone();
        let id = ticket.id.clone();
        let handle = tokio::spawn(async move {
            let id = ticket.id.clone();
            match runner.run(ticket).await {
                Ok(disposition) => debug!("Ticket {} attempt finished: {:?}", id, disposition),
                Err(e) => error!("Ticket {} lost its store: {}", id, e),
            }
        });
        self.active.insert(id, handle);
    }

    /// Drop finished tasks; a panicked task's ticket is cancelled
    async fn reap(&mut self) {
        let finished: Vec<String> = self
            .active
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for id in finished {
            let Some(handle) = self.active.remove(&id) else {
                continue;
            };
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Worker for ticket {} panicked", id);
                    self.cancel(&id, "worker panicked").await;
                }
            }
        }
    }

    /// Watch-driven loop; returns after draining once `shutdown` flips to true
    /// or its sender goes away
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ShutdownReport {
        if let Some(pool) = &self.pool {
            match pool.reclaim_stale() {
                Ok(slots) if !slots.is_empty() => info!("Reclaimed stale slots {:?}", slots),
                Ok(_) => {}
                Err(e) => warn!("Stale slot reclaim failed: {}", e),
            }
        }
        info!(
            "Engine started (max_concurrent {}, poll every {:?})",
            self.config.max_concurrent, self.config.poll_interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let dispatched = match self.poll_once().await {
                Ok(report) => report.dispatched_any(),
                Err(e) => {
                    error!("Scheduling cycle failed: {}", e);
                    false
                }
            };
            let interval = self.backoff.next_interval(dispatched);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Shutdown requested, draining {} task(s)", self.active.len());
        self.drain().await
    }

    /// Poll until a cycle dispatches nothing and no task is running
    pub async fn run_until_idle(&mut self) -> StoreResult<()> {
        loop {
            let report = self.poll_once().await?;
            if !report.dispatched_any() && self.active.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Move a ticket the engine gave up on to `cancelled`, freeing its slot
    pub(super) async fn cancel(&self, id: &str, reason: &str) {
        let ticket = match self.store.get(id).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => return,
            Err(e) => {
                error!("Could not load {} to cancel it: {}", id, e);
                return;
            }
        };

        if let Some(pool) = &self.pool {
            let mut slots = match self.store.running_slots(id).await {
                Ok(slots) => slots,
                Err(e) => {
                    warn!("Could not list running steps of {}: {}", id, e);
                    Vec::new()
                }
            };
            if let Some(slot) = ticket.lease_id.and_then(|l| u32::try_from(l).ok()) {
                if !slots.contains(&slot) {
                    slots.push(slot);
                }
            }
            for slot in slots {
                match pool.force_release(slot) {
                    Ok(true) => info!("Force-released slot {} held by {}", slot, id),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to release slot {} for {}: {}", slot, id, e),
                }
            }
        }

        let from = TicketState::LEASED;
        let update = TicketUpdate::new().clear_lease().hold(reason);
        match self
            .store
            .transition(id, &from, TicketState::Cancelled, update)
            .await
        {
            Ok(true) => {
                warn!("Ticket {} cancelled: {}", id, reason);
                let event = TicketEvent::new(
                    id,
                    "cancelled",
                    Some(ticket.state),
                    Some(TicketState::Cancelled),
                    json!({"reason": reason}),
                );
                if let Err(e) = self.store.record_event(event).await {
                    warn!("Failed to record cancellation of {}: {}", id, e);
                }
            }
            Ok(false) => debug!("Ticket {} already left its active state", id),
            Err(e) => error!("Failed to cancel {}: {}", id, e),
        }
    }

    async fn record(&self, id: &str, event_type: &str, from: TicketState, to: TicketState) {
        let event = TicketEvent::new(id, event_type, Some(from), Some(to), json!({}));
        if let Err(e) = self.store.record_event(event).await {
            warn!("Failed to record {} event for {}: {}", event_type, id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::SlotState;
    use crate::store::StepExecutionRecord;
    use crate::testing::TestHarness;

    #[tokio::test]
    async fn test_cancel_releases_every_running_slot() {
        let harness = TestHarness::new();
        let mut ticket = Ticket::new("T-1", "coder");
        ticket.state = TicketState::InProgress;
        harness.store.insert(ticket).await;

        // Two parallel steps whose runners never released their leases
        let mut slots = Vec::new();
        for step in ["draft_a", "draft_b"] {
            let lease = harness.pool.acquire().await.unwrap();
            let mut record =
                StepExecutionRecord::start(Some("T-1".to_string()), "T-1-1", step, "coder");
            record.slot = Some(lease.slot());
            harness.store.record_step(&record).await.unwrap();
            harness.store.set_lease("T-1", i64::from(lease.slot())).await.unwrap();
            slots.push(lease.slot());
            std::mem::forget(lease);
        }
        let held = harness.store.get("T-1").await.unwrap().unwrap();
        assert_eq!(held.lease_id, Some(i64::from(slots[1])));

        harness.engine().cancel("T-1", "stopped").await;

        for status in harness.pool.status().unwrap() {
            assert!(!matches!(status.state, SlotState::Held(_)), "{:?}", status);
        }
        let ticket = harness.store.get("T-1").await.unwrap().unwrap();
        assert_eq!(ticket.state, TicketState::Cancelled);
        assert_eq!(ticket.lease_id, None);
    }
}
