//! # Breaker State Machine
//!
//! Three states over the shared store: `CLOSED` (requests pass, failures
//! counted), `OPEN` (requests fast-fail until the reset window elapses)
//! and `HALF_OPEN` (a single probe request is let through to test the
//! upstream). Every transition is a compare-and-swap in the state store,
//! so concurrent observations from any number of requests or replicas
//! collapse to one transition, and events fire only on the winning swap.
//!
//! The OPEN -> HALF_OPEN transition is driven two ways: the instance that
//! opened the breaker arms a local timer, and every state read lazily
//! checks the persisted `opened_at` stamp, so in a replicated deployment
//! any replica can complete the transition even if the opener is gone.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::state::{BreakerSnapshot, BreakerState, StateStore, StoreError};

/// Breaker lifecycle events broadcast to the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Open,
    Close,
    HalfOpen,
    Rejected,
}

impl BreakerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerEvent::Open => "open",
            BreakerEvent::Close => "close",
            BreakerEvent::HalfOpen => "halfOpen",
            BreakerEvent::Rejected => "rejected",
        }
    }
}

/// Handler plug-in invoked on configured transitions (`onOpen`,
/// `onClose`, `onRejected` ids in the breaker config)
pub trait BreakerEventHandler: Send + Sync {
    fn invoke(&self, path: &str, event: BreakerEvent);
}

/// Built-in `log` handler
pub struct LogEventHandler;

impl BreakerEventHandler for LogEventHandler {
    fn invoke(&self, path: &str, event: BreakerEvent) {
        info!(api = %path, event = event.as_str(), "circuit breaker event");
    }
}

/// Fixed observer interface on the breaker.
///
/// Implementations must be cheap and non-blocking; they run inline on
/// state transitions.
pub trait BreakerObserver: Send + Sync {
    fn on_open(&self, _path: &str) {}
    fn on_close(&self, _path: &str) {}
    fn on_half_open(&self, _path: &str) {}
    fn on_rejected(&self, _path: &str) {}
}

/// Observer that ignores everything
pub struct NullObserver;

impl BreakerObserver for NullObserver {}

/// Runtime options for one breaker instance
#[derive(Debug, Clone)]
pub struct BreakerOptions {
    /// Deadline for the downstream stages to produce a response
    pub timeout: Duration,

    /// How long the breaker stays OPEN before half-opening
    pub reset_timeout: Duration,

    /// Consecutive failures that trip CLOSED -> OPEN
    pub max_failures: u32,
}

impl From<&CircuitBreakerConfig> for BreakerOptions {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout),
            reset_timeout: Duration::from_millis(config.reset_timeout),
            max_failures: config.max_failures,
        }
    }
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

/// The breaker governing one API path.
///
/// Holds no state of its own beyond configuration; all mutable state
/// lives in the store so every instance and replica for the path agrees.
pub struct CircuitBreaker {
    path: String,
    options: BreakerOptions,
    store: Arc<dyn StateStore>,
    observer: Arc<dyn BreakerObserver>,
}

impl CircuitBreaker {
    pub fn new(
        path: impl Into<String>,
        options: BreakerOptions,
        store: Arc<dyn StateStore>,
        observer: Arc<dyn BreakerObserver>,
    ) -> Self {
        Self {
            path: path.into(),
            options,
            store,
            observer,
        }
    }

    /// API path whose shared state this breaker reads and writes
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &BreakerOptions {
        &self.options
    }

    /// Current state, applying the lazy OPEN -> HALF_OPEN transition when
    /// the persisted reset window has elapsed
    pub async fn snapshot(&self) -> Result<BreakerSnapshot, StoreError> {
        let snapshot = self.store.get_state(&self.path).await?;

        if snapshot.state == BreakerState::Open {
            if let Some(opened_at) = snapshot.opened_at {
                let elapsed = opened_at.elapsed().unwrap_or_default();
                if elapsed >= self.options.reset_timeout {
                    if self
                        .store
                        .set_state(&self.path, BreakerState::HalfOpen, BreakerState::Open)
                        .await?
                    {
                        self.observer.on_half_open(&self.path);
                    }
                    return self.store.get_state(&self.path).await;
                }
            }
        }

        Ok(snapshot)
    }

    pub async fn is_open(&self) -> Result<bool, StoreError> {
        Ok(self.snapshot().await?.state == BreakerState::Open)
    }

    pub async fn is_half_open(&self) -> Result<bool, StoreError> {
        Ok(self.snapshot().await?.state == BreakerState::HalfOpen)
    }

    pub async fn is_closed(&self) -> Result<bool, StoreError> {
        Ok(self.snapshot().await?.state == BreakerState::Closed)
    }

    /// Record a failed observation: increment the shared counter and trip
    /// OPEN when the threshold is reached or a half-open probe failed
    pub async fn handle_failure(&self) {
        let count = match self.store.increment_failures(&self.path).await {
            Ok(count) => count,
            Err(err) => {
                warn!(api = %self.path, error = %err, "failed to record breaker failure");
                return;
            }
        };

        let state = match self.store.get_state(&self.path).await {
            Ok(snapshot) => snapshot.state,
            Err(err) => {
                warn!(api = %self.path, error = %err, "failed to read breaker state");
                return;
            }
        };

        debug!(api = %self.path, failures = count, state = %state, "breaker failure observed");

        if count >= self.options.max_failures || state == BreakerState::HalfOpen {
            if let Err(err) = self.force_open().await {
                warn!(api = %self.path, error = %err, "failed to open breaker");
            }
        }
    }

    /// Record a successful observation: force CLOSED (clears the counter)
    pub async fn handle_success(&self) {
        if let Err(err) = self.force_close().await {
            warn!(api = %self.path, error = %err, "failed to close breaker");
        }
    }

    /// Idempotent transition to OPEN; arms the reset timer on the winning
    /// swap and emits `open`
    pub async fn force_open(&self) -> Result<bool, StoreError> {
        let current = self.store.get_state(&self.path).await?;
        if current.state == BreakerState::Open {
            return Ok(false);
        }

        let changed = self
            .store
            .set_state(&self.path, BreakerState::Open, current.state)
            .await?;

        if changed {
            self.observer.on_open(&self.path);
            self.arm_reset_timer().await;
        }
        Ok(changed)
    }

    /// Idempotent transition to CLOSED, emitting `close` only on an
    /// actual state change. A success while already CLOSED clears the
    /// failure counter without emitting anything.
    pub async fn force_close(&self) -> Result<bool, StoreError> {
        let current = self.store.get_state(&self.path).await?;
        if current.state == BreakerState::Closed {
            if current.failures > 0 {
                self.store.clear_failures(&self.path).await?;
            }
            return Ok(false);
        }

        let changed = self
            .store
            .set_state(&self.path, BreakerState::Closed, current.state)
            .await?;

        if changed {
            self.observer.on_close(&self.path);
        }
        Ok(changed)
    }

    /// Idempotent transition to HALF_OPEN
    pub async fn force_half_open(&self) -> Result<bool, StoreError> {
        let current = self.store.get_state(&self.path).await?;
        if current.state == BreakerState::HalfOpen {
            return Ok(false);
        }

        let changed = self
            .store
            .set_state(&self.path, BreakerState::HalfOpen, current.state)
            .await?;

        if changed {
            self.observer.on_half_open(&self.path);
        }
        Ok(changed)
    }

    /// Claim the single half-open probe slot; `true` when this caller won
    pub async fn begin_probe(&self) -> Result<bool, StoreError> {
        Ok(!self.store.set_half_open_pending(&self.path, true).await?)
    }

    /// Release the probe slot after a failed or timed-out probe
    pub async fn end_probe(&self) {
        if let Err(err) = self.store.set_half_open_pending(&self.path, false).await {
            warn!(api = %self.path, error = %err, "failed to release probe slot");
        }
    }

    /// Emit `rejected` for a fast-failed request
    pub fn reject(&self) {
        self.observer.on_rejected(&self.path);
    }

    /// Local reset timer for the OPEN we just entered. The generation
    /// guard keeps a stale timer from half-opening a later OPEN early;
    /// replicas without the timer rely on the lazy `opened_at` check.
    async fn arm_reset_timer(&self) {
        let generation = match self.store.get_state(&self.path).await {
            Ok(snapshot) => snapshot.generation,
            Err(err) => {
                warn!(api = %self.path, error = %err, "failed to arm breaker reset timer");
                return;
            }
        };

        let store = self.store.clone();
        let observer = self.observer.clone();
        let path = self.path.clone();
        let reset_timeout = self.options.reset_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(reset_timeout).await;

            let snapshot = match store.get_state(&path).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(api = %path, error = %err, "reset timer could not read breaker state");
                    return;
                }
            };
            if snapshot.state != BreakerState::Open || snapshot.generation != generation {
                return;
            }

            match store
                .set_state(&path, BreakerState::HalfOpen, BreakerState::Open)
                .await
            {
                Ok(true) => observer.on_half_open(&path),
                Ok(false) => {}
                Err(err) => {
                    warn!(api = %path, error = %err, "reset timer could not half-open breaker");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<&'static str>>,
    }

    impl Recording {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().clone()
        }
    }

    impl BreakerObserver for Recording {
        fn on_open(&self, _path: &str) {
            self.events.lock().push("open");
        }
        fn on_close(&self, _path: &str) {
            self.events.lock().push("close");
        }
        fn on_half_open(&self, _path: &str) {
            self.events.lock().push("halfOpen");
        }
        fn on_rejected(&self, _path: &str) {
            self.events.lock().push("rejected");
        }
    }

    fn breaker(
        max_failures: u32,
        reset_timeout: Duration,
    ) -> (CircuitBreaker, Arc<MemoryStateStore>, Arc<Recording>) {
        let store = Arc::new(MemoryStateStore::new());
        let observer = Arc::new(Recording::default());
        let breaker = CircuitBreaker::new(
            "/api",
            BreakerOptions {
                timeout: Duration::from_millis(100),
                reset_timeout,
                max_failures,
            },
            store.clone() as Arc<dyn StateStore>,
            observer.clone() as Arc<dyn BreakerObserver>,
        );
        (breaker, store, observer)
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let (breaker, _, observer) = breaker(3, Duration::from_secs(60));

        breaker.handle_failure().await;
        breaker.handle_failure().await;
        assert!(breaker.is_closed().await.unwrap());
        assert!(observer.events().is_empty());

        breaker.handle_failure().await;
        assert!(breaker.is_open().await.unwrap());
        assert_eq!(observer.events(), vec!["open"]);
    }

    #[tokio::test]
    async fn test_success_in_closed_clears_counter_without_close_event() {
        let (breaker, store, observer) = breaker(3, Duration::from_secs(60));

        breaker.handle_failure().await;
        breaker.handle_failure().await;
        breaker.handle_success().await;

        assert_eq!(store.get_state("/api").await.unwrap().failures, 0);
        assert!(observer.events().is_empty());

        // Counter was reset, so two more failures still do not trip it
        breaker.handle_failure().await;
        breaker.handle_failure().await;
        assert!(breaker.is_closed().await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_regardless_of_counter() {
        let (breaker, _, observer) = breaker(10, Duration::from_secs(60));

        breaker.force_half_open().await.unwrap();
        breaker.handle_failure().await;

        assert!(breaker.is_open().await.unwrap());
        assert_eq!(observer.events(), vec!["halfOpen", "open"]);
    }

    #[tokio::test]
    async fn test_probe_success_closes_and_clears() {
        let (breaker, store, observer) = breaker(2, Duration::from_secs(60));

        breaker.handle_failure().await;
        breaker.handle_failure().await;
        breaker.force_half_open().await.unwrap();
        assert!(breaker.begin_probe().await.unwrap());

        breaker.handle_success().await;

        let snapshot = store.get_state("/api").await.unwrap();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failures, 0);
        assert!(!snapshot.half_open_pending);
        assert_eq!(observer.events(), vec!["open", "halfOpen", "close"]);
    }

    #[tokio::test]
    async fn test_single_probe_slot() {
        let (breaker, _, _) = breaker(1, Duration::from_secs(60));
        breaker.force_half_open().await.unwrap();

        assert!(breaker.begin_probe().await.unwrap());
        assert!(!breaker.begin_probe().await.unwrap());

        breaker.end_probe().await;
        assert!(breaker.begin_probe().await.unwrap());
    }

    #[tokio::test]
    async fn test_force_transitions_are_idempotent() {
        let (breaker, _, observer) = breaker(1, Duration::from_secs(60));

        assert!(breaker.force_open().await.unwrap());
        assert!(!breaker.force_open().await.unwrap());
        assert!(breaker.force_close().await.unwrap());
        assert!(!breaker.force_close().await.unwrap());

        assert_eq!(observer.events(), vec!["open", "close"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_timer_half_opens_after_reset_timeout() {
        let (breaker, _, observer) = breaker(1, Duration::from_millis(500));

        breaker.handle_failure().await;
        assert!(breaker.is_open().await.unwrap());

        // Paused time auto-advances while we sleep past the reset window
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(breaker.is_half_open().await.unwrap());
        assert_eq!(observer.events(), vec!["open", "halfOpen"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_half_open_a_later_open() {
        let (breaker, _, _) = breaker(1, Duration::from_secs(10));

        breaker.handle_failure().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Manual close and a fresh trip re-arm the window
        breaker.force_close().await.unwrap();
        breaker.handle_failure().await;

        // First timer fires at t=10s against the second OPEN: stale
        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert!(breaker.is_open().await.unwrap());

        // Second timer fires at t=11s
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(breaker.is_half_open().await.unwrap());
    }
}
