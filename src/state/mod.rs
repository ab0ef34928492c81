//! # Shared Breaker State Store
//!
//! Durable shared counters and state keyed by API path, so circuit
//! breakers in multiple gateway replicas agree on a path's health. The
//! store is the only mutable shared resource in the gateway; every access
//! goes through the atomic operations below, and implementations must
//! serialize state transitions per path.
//!
//! Store unavailability surfaces as a transient [`StoreError`] from each
//! operation. The breaker treats that as "fail open" on the hot path: the
//! request goes through and the outcome is not recorded.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Circuit-breaker states shared across replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one path's breaker state
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,

    /// Monotonic failure counter, cleared on close
    pub failures: u32,

    /// Single probe slot while half-open
    pub half_open_pending: bool,

    /// When the breaker last opened; persisted so any replica may trigger
    /// the OPEN -> HALF_OPEN transition once the reset window elapses
    pub opened_at: Option<SystemTime>,

    /// Bumped on every successful state transition; lets locally armed
    /// timers detect that the OPEN they were scheduled for is stale
    pub generation: u64,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            half_open_pending: false,
            opened_at: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Atomic primitives over per-path breaker state.
///
/// `set_state` is a compare-and-swap on the state field; on success the
/// store applies the transition's bookkeeping: entering `Open` stamps
/// `opened_at`, entering `Closed` clears the failure counter, the probe
/// slot and `opened_at`, entering `HalfOpen` clears the probe slot and
/// `opened_at`. `increment_failures` is atomic and returns the
/// post-increment count.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, path: &str) -> Result<BreakerSnapshot, StoreError>;

    /// Compare-and-swap: applies `new` only if the current state equals
    /// `expected`; returns whether the swap happened
    async fn set_state(
        &self,
        path: &str,
        new: BreakerState,
        expected: BreakerState,
    ) -> Result<bool, StoreError>;

    async fn increment_failures(&self, path: &str) -> Result<u32, StoreError>;

    async fn clear_failures(&self, path: &str) -> Result<(), StoreError>;

    /// Set the half-open probe slot, returning its prior value
    async fn set_half_open_pending(&self, path: &str, pending: bool) -> Result<bool, StoreError>;

    /// Create the path's state on first configure (closed, zero failures)
    async fn ensure(&self, path: &str) -> Result<(), StoreError>;

    /// Explicit reconfigure reset back to the initial state
    async fn reset(&self, path: &str) -> Result<(), StoreError>;
}

/// In-process store implementation.
///
/// One mutex per path gives the per-path transition serialization the
/// trait demands. Replicated deployments swap this for a store backed by
/// shared infrastructure behind the same trait.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    paths: DashMap<String, Arc<Mutex<BreakerSnapshot>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, path: &str) -> Arc<Mutex<BreakerSnapshot>> {
        self.paths
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerSnapshot::default())))
            .clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_state(&self, path: &str) -> Result<BreakerSnapshot, StoreError> {
        Ok(self.slot(path).lock().clone())
    }

    async fn set_state(
        &self,
        path: &str,
        new: BreakerState,
        expected: BreakerState,
    ) -> Result<bool, StoreError> {
        let slot = self.slot(path);
        let mut snapshot = slot.lock();

        if snapshot.state != expected {
            return Ok(false);
        }

        snapshot.state = new;
        snapshot.generation += 1;
        match new {
            BreakerState::Open => {
                snapshot.opened_at = Some(SystemTime::now());
            }
            BreakerState::Closed => {
                snapshot.failures = 0;
                snapshot.half_open_pending = false;
                snapshot.opened_at = None;
            }
            BreakerState::HalfOpen => {
                snapshot.half_open_pending = false;
                snapshot.opened_at = None;
            }
        }

        Ok(true)
    }

    async fn increment_failures(&self, path: &str) -> Result<u32, StoreError> {
        let slot = self.slot(path);
        let mut snapshot = slot.lock();
        snapshot.failures += 1;
        Ok(snapshot.failures)
    }

    async fn clear_failures(&self, path: &str) -> Result<(), StoreError> {
        self.slot(path).lock().failures = 0;
        Ok(())
    }

    async fn set_half_open_pending(&self, path: &str, pending: bool) -> Result<bool, StoreError> {
        let slot = self.slot(path);
        let mut snapshot = slot.lock();
        let prior = snapshot.half_open_pending;
        snapshot.half_open_pending = pending;
        Ok(prior)
    }

    async fn ensure(&self, path: &str) -> Result<(), StoreError> {
        self.slot(path);
        Ok(())
    }

    async fn reset(&self, path: &str) -> Result<(), StoreError> {
        *self.slot(path).lock() = BreakerSnapshot::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state_is_closed() {
        let store = MemoryStateStore::new();
        store.ensure("/api").await.unwrap();

        let snapshot = store.get_state("/api").await.unwrap();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failures, 0);
        assert!(!snapshot.half_open_pending);
    }

    #[tokio::test]
    async fn test_cas_succeeds_only_from_expected_state() {
        let store = MemoryStateStore::new();

        assert!(store
            .set_state("/api", BreakerState::Open, BreakerState::Closed)
            .await
            .unwrap());
        // Second identical CAS loses: state is no longer Closed
        assert!(!store
            .set_state("/api", BreakerState::Open, BreakerState::Closed)
            .await
            .unwrap());

        let snapshot = store.get_state("/api").await.unwrap();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert!(snapshot.opened_at.is_some());
        assert_eq!(snapshot.generation, 1);
    }

    #[tokio::test]
    async fn test_close_clears_counter_and_probe_slot() {
        let store = MemoryStateStore::new();
        store.increment_failures("/api").await.unwrap();
        store.increment_failures("/api").await.unwrap();
        store
            .set_state("/api", BreakerState::Open, BreakerState::Closed)
            .await
            .unwrap();
        store
            .set_state("/api", BreakerState::HalfOpen, BreakerState::Open)
            .await
            .unwrap();
        store.set_half_open_pending("/api", true).await.unwrap();

        store
            .set_state("/api", BreakerState::Closed, BreakerState::HalfOpen)
            .await
            .unwrap();

        let snapshot = store.get_state("/api").await.unwrap();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failures, 0);
        assert!(!snapshot.half_open_pending);
        assert!(snapshot.opened_at.is_none());
    }

    #[tokio::test]
    async fn test_increment_returns_post_increment_count() {
        let store = MemoryStateStore::new();

        assert_eq!(store.increment_failures("/api").await.unwrap(), 1);
        assert_eq!(store.increment_failures("/api").await.unwrap(), 2);
        store.clear_failures("/api").await.unwrap();
        assert_eq!(store.increment_failures("/api").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_probe_slot_returns_prior_value() {
        let store = MemoryStateStore::new();

        assert!(!store.set_half_open_pending("/api", true).await.unwrap());
        assert!(store.set_half_open_pending("/api", true).await.unwrap());
        assert!(store.set_half_open_pending("/api", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_paths_are_independent() {
        let store = MemoryStateStore::new();
        store.increment_failures("/a").await.unwrap();

        assert_eq!(store.get_state("/b").await.unwrap().failures, 0);
    }
}
