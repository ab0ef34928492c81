//! # Pipeline Assembler
//!
//! Composes one API's stages into a matched route chain. Per API, in
//! fixed order: request-log initializer, circuit-breaker stages,
//! authentication stages, rate limit, upstream proxy. Inside the breaker
//! and authentication categories the default-last sort applies;
//! group-scoped stages bypass to the next stage when their filter
//! rejects.

use std::sync::Arc;

use axum::extract::{OriginalUri, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use metrics::counter;
use tracing::info;

use crate::auth::{self, StrategyRegistrations};
use crate::breaker;
use crate::config::{ApiConfig, PipelineConfig};
use crate::core::error::GatewayResult;
use crate::core::types::RequestLog;
use crate::groups::compile_groups;
use crate::plugins::PluginRegistry;
use crate::proxy::ProxyStage;
use crate::ratelimit;
use crate::state::StateStore;

/// Everything the assembler needs besides the API config itself
pub struct PipelineContext<'a> {
    pub registry: &'a PluginRegistry,
    pub store: &'a Arc<dyn StateStore>,
    pub client: &'a reqwest::Client,
    pub pipeline: &'a PipelineConfig,
    pub registrations: &'a StrategyRegistrations,
}

/// Outermost stage: creates the request log record, emits the log line
/// and the per-API counters once the response is ready
struct LogStage {
    api: String,
    request_log: bool,
    stats: bool,
}

async fn run_log_stage(stage: Arc<LogStage>, mut req: Request, next: Next) -> Response {
    let log = RequestLog::new(&stage.api);
    req.extensions_mut().insert(log.clone());

    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.0.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;
    let status = response.status();

    if stage.stats {
        counter!(
            "gateway_requests_total",
            "api" => stage.api.clone(),
            "status" => status.as_u16().to_string(),
        )
        .increment(1);
    }

    if stage.request_log {
        info!(
            request_id = %log.id(),
            api = %stage.api,
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms = log.elapsed_ms() as u64,
            authentication = log.authentication().unwrap_or("none"),
            "request completed"
        );
    }

    response
}

/// Build the matched route chain for one API, to be nested under
/// `api.path` on the root router.
///
/// Fails only for errors that leave no usable pipeline (invalid path,
/// unusable proxy target); broken individual stages are logged and
/// omitted by their builders.
pub fn build_api_router(api: &ApiConfig, ctx: &PipelineContext<'_>) -> GatewayResult<Router> {
    api.validate()?;
    let groups = compile_groups(&api.group);

    let proxy = Arc::new(ProxyStage::from_config(
        ctx.client.clone(),
        &api.proxy,
        &api.path,
    )?);
    let proxy_handler = move |req: Request| {
        let proxy = proxy.clone();
        async move { proxy.handle(req).await }
    };
    let proxy_router = Router::new()
        .route("/", any(proxy_handler.clone()))
        .route("/*path", any(proxy_handler));

    let mut router = if api.proxy.path == "/" {
        proxy_router
    } else {
        Router::new().nest(&api.proxy.path, proxy_router)
    };

    // Layers wrap inside-out: the last one added runs first. Categories
    // are added innermost (rate limit) to outermost (request log), and
    // the stage lists are reversed so their first entry runs first.
    if let Some(config) = &api.rate_limit {
        if let Some(stage) = ratelimit::resolve_stage(config, &api.path, ctx.registry) {
            router = router.layer(middleware::from_fn(move |req: Request, next: Next| {
                let stage = stage.clone();
                async move { ratelimit::run_stage(stage, req, next).await }
            }));
        }
    }

    let auth_stages =
        auth::build_auth_stages(api, &groups, ctx.registry, ctx.pipeline, ctx.registrations);
    for stage in auth_stages.into_iter().rev() {
        let stage = Arc::new(stage);
        router = router.layer(middleware::from_fn(move |req: Request, next: Next| {
            let stage = stage.clone();
            async move { auth::run_stage(stage, req, next).await }
        }));
    }

    let breaker_stages = breaker::resolve_breakers(api, &groups, ctx.registry, ctx.store);
    for stage in breaker_stages.into_iter().rev() {
        let stage = Arc::new(stage);
        router = router.layer(middleware::from_fn(move |req: Request, next: Next| {
            let stage = stage.clone();
            async move { breaker::middleware::run_stage(stage, req, next).await }
        }));
    }

    if api.request_log || api.stats {
        let stage = Arc::new(LogStage {
            api: api.path.clone(),
            request_log: api.request_log,
            stats: api.stats,
        });
        router = router.layer(middleware::from_fn(move |req: Request, next: Next| {
            let stage = stage.clone();
            async move { run_log_stage(stage, req, next).await }
        }));
    }

    Ok(router)
}
