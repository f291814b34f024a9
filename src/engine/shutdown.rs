use super::scheduler::Engine;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

pub const SHUTDOWN_REASON: &str = "engine shutdown";

/// How the drain went
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    /// Tasks that finished within the shutdown timeout
    pub finished: Vec<String>,
    /// Tasks aborted after the timeout; their tickets were cancelled
    pub cancelled: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.cancelled.is_empty()
    }
}

impl Engine {
    /// Wait up to `shutdown_timeout` for active tasks, then abort the rest,
    /// release their slots and cancel their tickets
    pub async fn drain(&mut self) -> ShutdownReport {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut report = ShutdownReport::default();

        let mut active: Vec<_> = self.active.drain().collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, mut handle) in active {
            match timeout_at(deadline, &mut handle).await {
                Ok(_) => report.finished.push(id),
                Err(_) => {
                    warn!("Ticket {} did not finish before the shutdown timeout", id);
                    handle.abort();
                    let _ = handle.await;
                    self.cancel(&id, SHUTDOWN_REASON).await;
                    report.cancelled.push(id);
                }
            }
        }

        info!(
            "Drain complete: {} finished, {} cancelled",
            report.finished.len(),
            report.cancelled.len()
        );
        report
    }
}
