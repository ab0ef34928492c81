//! # Authentication Stages
//!
//! Turns an API's authentication config list into an ordered, group-scoped
//! chain of authenticator stages. Strategies are plug-ins resolved by name
//! through the registry; each stage marks the request log with the outcome
//! and either inserts the authenticated [`Principal`] or returns the
//! strategy's error response. Sessions do not exist: a failure is a
//! response, never a redirect.

pub mod strategies;

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use tracing::{debug, error};

use crate::config::{resolve_use, sort_default_last, ApiConfig, PipelineConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Principal, RequestLog, AUTH_FAIL, AUTH_SUCCESS};
use crate::groups::{build_allow_filter, Group, GroupFilter};
use crate::plugins::{PluginReference, PluginRegistry};

/// One pluggable authentication strategy, bound to its options at load
/// time. Strategies inspect the request head only; a request body is
/// never consumed during authentication.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Scheme name, recorded on the resulting [`Principal`]
    fn scheme(&self) -> &'static str;

    async fn authenticate(&self, req: &Request) -> GatewayResult<Principal>;
}

/// Strategy instances live here under a key unique per `(api, index)`,
/// so repeated configures replace rather than collide.
pub type StrategyRegistrations = DashMap<String, Arc<dyn AuthStrategy>>;

/// One authentication stage: a loaded strategy plus its optional group
/// gate
pub struct AuthStage {
    pub key: String,
    pub strategy: Arc<dyn AuthStrategy>,
    pub filter: Option<GroupFilter>,
}

/// Build an API's ordered authentication stages.
///
/// The default (group-less) entry sorts last; more than one default is a
/// configuration error that installs no authentication for the API. An
/// entry with an unresolved `use` reference or an unknown strategy is
/// logged and skipped on its own.
pub fn build_auth_stages(
    api: &ApiConfig,
    groups: &[Arc<Group>],
    registry: &PluginRegistry,
    pipeline: &PipelineConfig,
    registrations: &StrategyRegistrations,
) -> Vec<AuthStage> {
    let sorted = match sort_default_last(api.authentication.clone(), "authentication") {
        Ok(sorted) => sorted,
        Err(err) => {
            error!(api = %api.path, error = %err, "rejecting authentication configuration");
            return Vec::new();
        }
    };

    let mut stages = Vec::new();
    for (index, entry) in sorted.iter().enumerate() {
        let resolved = match resolve_use(entry, &pipeline.authentication) {
            Ok(resolved) => resolved,
            Err(err) => {
                error!(api = %api.path, error = %err, "skipping authentication stage");
                continue;
            }
        };

        // resolve_use guarantees a strategy is present
        let Some(strategy_config) = resolved.strategy.as_ref() else {
            continue;
        };
        let reference =
            PluginReference::new(strategy_config.name.clone(), strategy_config.options.clone());

        let strategy = match registry.load_auth_strategy(&reference) {
            Ok(strategy) => strategy,
            Err(err) => {
                error!(api = %api.path, error = %err, "skipping authentication stage");
                continue;
            }
        };

        let key = format!("{}#{}", api.path, index);
        registrations.insert(key.clone(), strategy.clone());

        stages.push(AuthStage {
            key,
            strategy,
            filter: build_allow_filter(groups, resolved.group.as_deref()),
        });
    }
    stages
}

/// Run one authentication stage.
///
/// A rejecting group filter bypasses the stage entirely; the request
/// reaches the next stage unauthenticated. Otherwise the strategy runs,
/// the outcome lands on the request log, and a failure short-circuits
/// with the strategy's error response.
pub async fn run_stage(stage: Arc<AuthStage>, mut req: Request, next: Next) -> Response {
    if let Some(filter) = &stage.filter {
        if !filter.allows(req.method(), req.uri().path()) {
            return next.run(req).await;
        }
    }

    match stage.strategy.authenticate(&req).await {
        Ok(principal) => {
            if let Some(log) = req.extensions().get::<RequestLog>() {
                log.mark_authentication(AUTH_SUCCESS);
            }
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(err) => {
            if let Some(log) = req.extensions().get::<RequestLog>() {
                log.mark_authentication(AUTH_FAIL);
            }
            debug!(stage = %stage.key, scheme = stage.strategy.scheme(), error = %err, "authentication failed");
            err.into_response()
        }
    }
}

/// Shorthand for an authentication rejection with the conventional reason
pub(crate) fn unauthorized(reason: impl Into<String>) -> GatewayError {
    GatewayError::auth(reason)
}
