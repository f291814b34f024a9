//! Lease pool
//!
//! Grants exclusive use of numbered execution slots. Exclusion comes from the
//! slot lock files alone, so several engine processes may share one lock
//! directory. Acquisition first tries to reuse a running environment, then
//! cold-spawns one.

use super::driver::{DriverConfig, EnvironmentDriver};
use super::error::LeaseError;
use super::lock::{LockAttempt, LockDir, SlotLockData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LeaseConfig {
    /// Slots checked for a reusable environment
    pub pool_size: u32,
    /// Highest slot index a cold spawn may use
    pub max_slot_index: u32,
    pub lock_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub spawn_timeout: Duration,
    pub driver: DriverConfig,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_slot_index: 8,
            lock_dir: std::env::temp_dir().join("swarm-engine").join("locks"),
            probe_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(1),
            spawn_timeout: Duration::from_secs(60),
            driver: DriverConfig::default(),
        }
    }
}

/// An acquired slot
///
/// Dropping a lease that was not released removes its lock file, so a
/// cancelled task never leaves a slot held.
#[derive(Debug)]
pub struct Lease {
    slot: u32,
    address: String,
    acquired_at: DateTime<Utc>,
    reused: bool,
    holder: Uuid,
    locks: LockDir,
    released: bool,
}

impl Lease {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Network identity of the leased environment
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Whether an already-running environment was reused
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn release(mut self) -> Result<bool, LeaseError> {
        self.released = true;
        let removed = self.locks.remove_if_owned(self.slot, self.holder)?;
        if removed {
            info!("Released slot {}", self.slot);
        }
        Ok(removed)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.locks.remove_if_owned(self.slot, self.holder) {
            Ok(true) => warn!("Slot {} released on drop", self.slot),
            Ok(false) => {}
            Err(e) => warn!("Failed to release slot {} on drop: {}", self.slot, e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    Free,
    Held(SlotLockData),
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub slot: u32,
    #[serde(flatten)]
    pub state: SlotState,
}

pub struct LeasePool {
    config: LeaseConfig,
    locks: LockDir,
    driver: Arc<dyn EnvironmentDriver>,
    holder: Uuid,
    unhealthy: Mutex<HashSet<u32>>,
}

impl LeasePool {
    pub fn new(config: LeaseConfig, driver: Arc<dyn EnvironmentDriver>) -> Result<Self, LeaseError> {
        let locks = LockDir::new(&config.lock_dir)?;
        Ok(Self {
            config,
            locks,
            driver,
            holder: Uuid::new_v4(),
            unhealthy: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Identity written into every lock this pool takes
    pub fn holder_id(&self) -> Uuid {
        self.holder
    }

    pub fn driver(&self) -> Arc<dyn EnvironmentDriver> {
        Arc::clone(&self.driver)
    }

    /// Acquire a healthy slot
    pub async fn acquire(&self) -> Result<Lease, LeaseError> {
        if let Err(e) = self.reclaim_stale() {
            warn!("Stale lock reclaim failed: {}", e);
        }

        if let Some(lease) = self.acquire_existing().await? {
            return Ok(lease);
        }
        if let Some(lease) = self.acquire_cold().await? {
            return Ok(lease);
        }

        Err(LeaseError::PoolExhausted {
            max_slot: self.config.max_slot_index,
        })
    }

    /// Phase 1: reuse a running environment
    async fn acquire_existing(&self) -> Result<Option<Lease>, LeaseError> {
        for slot in 1..=self.config.pool_size {
            match self.driver.exists(slot).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!("Slot {} existence check failed: {}", slot, e);
                    continue;
                }
            }

            if !self.try_lock(slot)? {
                continue;
            }

            if self.probe(slot).await {
                self.mark_healthy(slot);
                info!("Reusing environment at slot {}", slot);
                return Ok(Some(self.lease(slot, true)));
            }

            warn!("Slot {} is unresponsive, skipping", slot);
            self.mark_unhealthy(slot);
            self.locks.remove_if_owned(slot, self.holder)?;
        }
        Ok(None)
    }

    /// Phase 2: spawn a fresh environment
    async fn acquire_cold(&self) -> Result<Option<Lease>, LeaseError> {
        for slot in 1..=self.config.max_slot_index {
            if !self.try_lock(slot)? {
                continue;
            }

            match self.spawn(slot).await {
                Ok(()) => {
                    self.mark_healthy(slot);
                    info!("Spawned environment at slot {}", slot);
                    return Ok(Some(self.lease(slot, false)));
                }
                Err(e) => {
                    warn!("Cold spawn at slot {} failed: {}", slot, e);
                    self.mark_unhealthy(slot);
                    self.locks.remove_if_owned(slot, self.holder)?;
                }
            }
        }
        Ok(None)
    }

    fn try_lock(&self, slot: u32) -> Result<bool, LeaseError> {
        match self.locks.try_lock(slot, self.holder) {
            Ok(LockAttempt::Acquired) => Ok(true),
            Ok(LockAttempt::Contended(_)) => Ok(false),
            Err(e @ LeaseError::CorruptLock { .. }) => {
                warn!("Skipping slot {}: {}", slot, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn probe(&self, slot: u32) -> bool {
        match tokio::time::timeout(self.config.probe_timeout, self.driver.probe(slot)).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                debug!("Probe of slot {} failed: {}", slot, e);
                false
            }
            Err(_) => false,
        }
    }

    async fn spawn(&self, slot: u32) -> Result<(), LeaseError> {
        if let Err(e) = self.driver.teardown(slot).await {
            debug!("Teardown of slot {} before spawn: {}", slot, e);
        }
        self.driver.spawn(slot).await?;

        let started = Instant::now();
        let deadline = started + self.config.spawn_timeout;
        loop {
            if self.probe(slot).await {
                return Ok(());
            }
            if Instant::now() + self.config.probe_interval > deadline {
                if let Err(e) = self.driver.teardown(slot).await {
                    debug!("Teardown of slot {} after failed spawn: {}", slot, e);
                }
                return Err(LeaseError::SpawnTimeout {
                    slot,
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }
    }

    fn lease(&self, slot: u32, reused: bool) -> Lease {
        Lease {
            slot,
            address: self.driver.address(slot),
            acquired_at: Utc::now(),
            reused,
            holder: self.holder,
            locks: self.locks.clone(),
            released: false,
        }
    }

    /// Release a slot held by this pool; a no-op otherwise
    pub fn release(&self, slot: u32) -> Result<bool, LeaseError> {
        self.check_slot(slot)?;
        self.locks.remove_if_owned(slot, self.holder)
    }

    /// Release a slot regardless of holder
    pub fn force_release(&self, slot: u32) -> Result<bool, LeaseError> {
        self.check_slot(slot)?;
        let removed = self.locks.remove(slot)?;
        if removed {
            warn!("Force-released slot {}", slot);
        }
        Ok(removed)
    }

    /// Remove locks left behind by dead processes
    pub fn reclaim_stale(&self) -> Result<Vec<u32>, LeaseError> {
        self.locks.reclaim_stale()
    }

    pub fn status(&self) -> Result<Vec<SlotStatus>, LeaseError> {
        let unhealthy = self.unhealthy_slots();
        (1..=self.config.max_slot_index.max(self.config.pool_size))
            .map(|slot| {
                let state = match self.locks.read(slot) {
                    Ok(Some(data)) => SlotState::Held(data),
                    Ok(None) if unhealthy.contains(&slot) => SlotState::Unhealthy,
                    Ok(None) => SlotState::Free,
                    Err(LeaseError::CorruptLock { .. }) => SlotState::Unhealthy,
                    Err(e) => return Err(e),
                };
                Ok(SlotStatus { slot, state })
            })
            .collect()
    }

    fn check_slot(&self, slot: u32) -> Result<(), LeaseError> {
        let max = self.config.max_slot_index.max(self.config.pool_size);
        if slot == 0 || slot > max {
            return Err(LeaseError::InvalidSlot(slot));
        }
        Ok(())
    }

    fn unhealthy_slots(&self) -> HashSet<u32> {
        self.unhealthy
            .lock()
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    fn mark_unhealthy(&self, slot: u32) {
        if let Ok(mut set) = self.unhealthy.lock() {
            set.insert(slot);
        }
    }

    fn mark_healthy(&self, slot: u32) {
        if let Ok(mut set) = self.unhealthy.lock() {
            set.remove(&slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEnvironmentDriver;
    use tempfile::TempDir;

    fn config(temp: &TempDir, pool_size: u32, max_slot_index: u32) -> LeaseConfig {
        LeaseConfig {
            pool_size,
            max_slot_index,
            lock_dir: temp.path().join("locks"),
            probe_timeout: Duration::from_millis(200),
            probe_interval: Duration::from_millis(10),
            spawn_timeout: Duration::from_millis(100),
            driver: DriverConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_reuses_existing_healthy_environment() {
        let temp = TempDir::new().unwrap();
        let driver = MockEnvironmentDriver::new().with_running(2);
        let pool = LeasePool::new(config(&temp, 4, 4), Arc::new(driver.clone())).unwrap();

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.slot(), 2);
        assert!(lease.reused());
        assert_eq!(driver.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_cold_spawns_when_nothing_running() {
        let temp = TempDir::new().unwrap();
        let driver = MockEnvironmentDriver::new();
        let pool = LeasePool::new(config(&temp, 2, 2), Arc::new(driver.clone())).unwrap();

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.slot(), 1);
        assert!(!lease.reused());
        assert_eq!(driver.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_unresponsive_environment_is_skipped_and_marked() {
        let temp = TempDir::new().unwrap();
        let driver = MockEnvironmentDriver::new()
            .with_running(1)
            .with_unresponsive(1)
            .with_running(2);
        let pool = LeasePool::new(config(&temp, 2, 2), Arc::new(driver)).unwrap();

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.slot(), 2);

        let status = pool.status().unwrap();
        assert_eq!(status[0].state, SlotState::Unhealthy);
        assert!(matches!(status[1].state, SlotState::Held(_)));
    }

    #[tokio::test]
    async fn test_pool_exhausted_when_all_slots_held() {
        let temp = TempDir::new().unwrap();
        let driver = MockEnvironmentDriver::new();
        let pool = LeasePool::new(config(&temp, 2, 2), Arc::new(driver)).unwrap();

        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, LeaseError::PoolExhausted { max_slot: 2 }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_spawn_that_never_becomes_healthy_fails_over() {
        let temp = TempDir::new().unwrap();
        let driver = MockEnvironmentDriver::new().with_unresponsive(1);
        let pool = LeasePool::new(config(&temp, 2, 2), Arc::new(driver)).unwrap();

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.slot(), 2);
        // the failed slot's lock was released
        assert!(pool.locks.read(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_lock_is_skipped() {
        let temp = TempDir::new().unwrap();
        let driver = MockEnvironmentDriver::new().with_running(1);
        let pool = LeasePool::new(config(&temp, 2, 2), Arc::new(driver)).unwrap();
        std::fs::write(temp.path().join("locks").join("slot-1.lock"), "{\"slot\":").unwrap();

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.slot(), 2);
        assert_eq!(pool.status().unwrap()[0].state, SlotState::Unhealthy);
    }

    #[tokio::test]
    async fn test_two_pools_never_share_a_slot() {
        let temp = TempDir::new().unwrap();
        let driver = Arc::new(MockEnvironmentDriver::new());
        let a = LeasePool::new(config(&temp, 1, 1), driver.clone()).unwrap();
        let b = LeasePool::new(config(&temp, 1, 1), driver).unwrap();

        let lease = a.acquire().await.unwrap();
        assert!(matches!(
            b.acquire().await,
            Err(LeaseError::PoolExhausted { .. })
        ));

        // b can't release a's slot
        assert!(!b.release(lease.slot()).unwrap());
        lease.release().unwrap();
        assert_eq!(b.acquire().await.unwrap().slot(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let pool = LeasePool::new(config(&temp, 1, 1), Arc::new(MockEnvironmentDriver::new()))
            .unwrap();

        let lease = pool.acquire().await.unwrap();
        let slot = lease.slot();
        assert!(pool.release(slot).unwrap());
        assert!(!pool.release(slot).unwrap());
        // the guard finds nothing left to remove
        assert!(!lease.release().unwrap());
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_slot() {
        let temp = TempDir::new().unwrap();
        let pool = LeasePool::new(config(&temp, 1, 1), Arc::new(MockEnvironmentDriver::new()))
            .unwrap();

        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.status().unwrap()[0].state, SlotState::Free);
    }

    #[tokio::test]
    async fn test_force_release_and_invalid_slot() {
        let temp = TempDir::new().unwrap();
        let driver = Arc::new(MockEnvironmentDriver::new());
        let a = LeasePool::new(config(&temp, 1, 1), driver.clone()).unwrap();
        let b = LeasePool::new(config(&temp, 1, 1), driver).unwrap();

        let _lease = a.acquire().await.unwrap();
        assert!(b.force_release(1).unwrap());
        assert!(matches!(b.force_release(9), Err(LeaseError::InvalidSlot(9))));
    }
}
