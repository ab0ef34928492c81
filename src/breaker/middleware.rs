//! # Breaker Request Stage
//!
//! Wraps the downstream stages of an API pipeline: fast-fails while the
//! breaker is OPEN (or HALF_OPEN with the probe slot taken), arms the
//! per-request timeout, and feeds the outcome back into the state
//! machine. The 503/504 bodies are wire-compatible and produced here
//! rather than through the generic error envelope.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::breaker::machine::{
    BreakerEvent, BreakerEventHandler, BreakerObserver, BreakerOptions, CircuitBreaker,
};
use crate::config::{sort_default_last, ApiConfig, CircuitBreakerConfig};
use crate::core::error::GatewayResult;
use crate::groups::{build_allow_filter, Group, GroupFilter};
use crate::plugins::{PluginReference, PluginRegistry};
use crate::state::{BreakerState, StateStore};

/// Observer wired into each breaker instance: structured logs, the
/// counters sink (unless stats are disabled for the entry), and the
/// configured handler plug-ins.
pub struct StageObserver {
    stats: bool,
    on_open: Option<Arc<dyn BreakerEventHandler>>,
    on_close: Option<Arc<dyn BreakerEventHandler>>,
    on_rejected: Option<Arc<dyn BreakerEventHandler>>,
}

impl StageObserver {
    fn count(&self, path: &str, event: BreakerEvent) {
        if self.stats {
            counter!(
                "gateway_breaker_events_total",
                "api" => path.to_string(),
                "event" => event.as_str(),
            )
            .increment(1);
        }
    }
}

impl BreakerObserver for StageObserver {
    fn on_open(&self, path: &str) {
        warn!(api = %path, "circuit breaker opened");
        self.count(path, BreakerEvent::Open);
        if let Some(handler) = &self.on_open {
            handler.invoke(path, BreakerEvent::Open);
        }
    }

    fn on_close(&self, path: &str) {
        info!(api = %path, "circuit breaker closed");
        self.count(path, BreakerEvent::Close);
        if let Some(handler) = &self.on_close {
            handler.invoke(path, BreakerEvent::Close);
        }
    }

    fn on_half_open(&self, path: &str) {
        info!(api = %path, "circuit breaker half-open");
        self.count(path, BreakerEvent::HalfOpen);
    }

    fn on_rejected(&self, path: &str) {
        debug!(api = %path, "circuit breaker rejected request");
        self.count(path, BreakerEvent::Rejected);
        if let Some(handler) = &self.on_rejected {
            handler.invoke(path, BreakerEvent::Rejected);
        }
    }
}

/// One breaker stage: a breaker instance plus its optional group gate
pub struct BreakerStage {
    pub breaker: Arc<CircuitBreaker>,
    pub filter: Option<GroupFilter>,
}

fn load_handler(
    registry: &PluginRegistry,
    name: Option<&String>,
) -> GatewayResult<Option<Arc<dyn BreakerEventHandler>>> {
    match name {
        Some(name) => Ok(Some(
            registry.load_breaker_handler(&PluginReference::named(name.clone()))?,
        )),
        None => Ok(None),
    }
}

/// Resolve an API's breaker configs into stages.
///
/// The default (group-less) entry sorts last; more than one default is a
/// configuration error that installs no breaker stages for the API. A
/// stage whose handler plug-ins fail to load is skipped on its own. All
/// surviving stages share one state keyed by the API path.
pub fn resolve_breakers(
    api: &ApiConfig,
    groups: &[Arc<Group>],
    registry: &PluginRegistry,
    store: &Arc<dyn StateStore>,
) -> Vec<BreakerStage> {
    let sorted = match sort_default_last(api.circuit_breaker.clone(), "circuit breaker") {
        Ok(sorted) => sorted,
        Err(err) => {
            error!(api = %api.path, error = %err, "rejecting circuit breaker configuration");
            return Vec::new();
        }
    };

    let mut stages = Vec::new();
    for config in &sorted {
        let stage = match build_stage(api, config, groups, registry, store) {
            Ok(stage) => stage,
            Err(err) => {
                error!(api = %api.path, error = %err, "skipping circuit breaker stage");
                continue;
            }
        };
        stages.push(stage);
    }
    stages
}

fn build_stage(
    api: &ApiConfig,
    config: &CircuitBreakerConfig,
    groups: &[Arc<Group>],
    registry: &PluginRegistry,
    store: &Arc<dyn StateStore>,
) -> GatewayResult<BreakerStage> {
    let observer = Arc::new(StageObserver {
        stats: !config.disable_stats,
        on_open: load_handler(registry, config.on_open.as_ref())?,
        on_close: load_handler(registry, config.on_close.as_ref())?,
        on_rejected: load_handler(registry, config.on_rejected.as_ref())?,
    });

    let breaker = Arc::new(CircuitBreaker::new(
        api.path.clone(),
        BreakerOptions::from(config),
        store.clone(),
        observer as Arc<dyn BreakerObserver>,
    ));

    Ok(BreakerStage {
        breaker,
        filter: build_allow_filter(groups, config.group.as_deref()),
    })
}

fn open_response() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "CircuitBreaker open").into_response()
}

fn timeout_response() -> Response {
    (StatusCode::GATEWAY_TIMEOUT, "CircuitBreaker timeout").into_response()
}

/// Run one breaker stage around the rest of the pipeline.
///
/// The timeout and the downstream response race through
/// `tokio::time::timeout`; whichever loses is a no-op. A dropped request
/// (client disconnect) abandons this future before either arm resolves,
/// so the outcome counts as neither success nor failure.
pub async fn run_stage(stage: Arc<BreakerStage>, req: Request, next: Next) -> Response {
    if let Some(filter) = &stage.filter {
        if !filter.allows(req.method(), req.uri().path()) {
            return next.run(req).await;
        }
    }

    let breaker = &stage.breaker;
    let snapshot = match breaker.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            // Fail open: the hot path must not depend on the store
            warn!(api = %breaker.path(), error = %err, "state store unavailable, failing open");
            return next.run(req).await;
        }
    };

    let mut probing = false;
    match snapshot.state {
        BreakerState::Open => {
            breaker.reject();
            return open_response();
        }
        BreakerState::HalfOpen => match breaker.begin_probe().await {
            Ok(true) => probing = true,
            Ok(false) => {
                breaker.reject();
                return open_response();
            }
            Err(err) => {
                warn!(api = %breaker.path(), error = %err, "state store unavailable, failing open");
            }
        },
        BreakerState::Closed => {}
    }

    match tokio::time::timeout(breaker.options().timeout, next.run(req)).await {
        Ok(response) => {
            if response.status().is_server_error() {
                if probing {
                    breaker.end_probe().await;
                }
                breaker.handle_failure().await;
            } else {
                breaker.handle_success().await;
            }
            response
        }
        Err(_) => {
            debug!(api = %breaker.path(), "breaker timeout fired before upstream completion");
            if probing {
                breaker.end_probe().await;
            }
            breaker.handle_failure().await;
            timeout_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::state::MemoryStateStore;

    fn api(breakers: Vec<CircuitBreakerConfig>) -> ApiConfig {
        ApiConfig {
            path: "/test".into(),
            proxy: ProxyConfig {
                target: "http://127.0.0.1:9000".into(),
                path: "/".into(),
                methods: None,
            },
            group: Vec::new(),
            authentication: Vec::new(),
            circuit_breaker: breakers,
            rate_limit: None,
            request_log: true,
            stats: true,
        }
    }

    fn scoped(group: Option<Vec<&str>>) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            group: group.map(|g| g.into_iter().map(String::from).collect()),
            ..CircuitBreakerConfig::default()
        }
    }

    #[test]
    fn test_two_default_entries_install_nothing() {
        let registry = PluginRegistry::with_builtins();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

        let stages = resolve_breakers(
            &api(vec![scoped(None), scoped(None)]),
            &[],
            &registry,
            &store,
        );

        assert!(stages.is_empty());
    }

    #[test]
    fn test_default_entry_sorts_last() {
        let registry = PluginRegistry::with_builtins();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

        let stages = resolve_breakers(
            &api(vec![scoped(None), scoped(Some(vec!["admins"]))]),
            &[],
            &registry,
            &store,
        );

        assert_eq!(stages.len(), 2);
        assert!(stages[0].filter.is_some());
        assert!(stages[1].filter.is_none());
    }

    #[test]
    fn test_unknown_handler_skips_only_that_stage() {
        let registry = PluginRegistry::with_builtins();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

        let broken = CircuitBreakerConfig {
            on_open: Some("missing-handler".into()),
            group: Some(vec!["admins".into()]),
            ..CircuitBreakerConfig::default()
        };

        let stages = resolve_breakers(&api(vec![broken, scoped(None)]), &[], &registry, &store);

        assert_eq!(stages.len(), 1);
        assert!(stages[0].filter.is_none());
    }

    #[tokio::test]
    async fn test_rejection_bodies_are_wire_compatible() {
        let open = open_response();
        assert_eq!(open.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(open.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"CircuitBreaker open");

        let timeout = timeout_response();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = axum::body::to_bytes(timeout.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"CircuitBreaker timeout");
    }
}
