//! # Rate-Limit Stage
//!
//! A fixed-window counter per key, slotted into the pipeline between the
//! authentication stages and the proxy. The key comes from a pluggable
//! generator (per client IP by default); over-limit requests receive the
//! wire-compatible 429 body.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use tracing::{debug, error};

use crate::config::RateLimitConfig;
use crate::plugins::{PluginHandler, PluginKind, PluginReference, PluginRegistry};

/// Derives the bucket key for a request
pub trait KeyGenerator: Send + Sync {
    fn key(&self, req: &Request) -> String;
}

/// Default keygen: `x-forwarded-for` first, then the peer address, else
/// one global bucket
pub struct IpKeyGen;

impl KeyGenerator for IpKeyGen {
    fn key(&self, req: &Request) -> String {
        if let Some(forwarded) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                return format!("ip:{}", first.trim());
            }
        }
        if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            return format!("ip:{}", addr.ip());
        }
        "global".to_string()
    }
}

/// Buckets per request path (as seen inside the API mount)
pub struct PathKeyGen;

impl KeyGenerator for PathKeyGen {
    fn key(&self, req: &Request) -> String {
        format!("path:{}", req.uri().path())
    }
}

pub fn register_builtin_keygens(registry: &PluginRegistry) {
    registry.register(
        PluginKind::RateLimitKeyGen,
        "ip",
        Arc::new(|_options| Ok(PluginHandler::KeyGen(Arc::new(IpKeyGen)))),
    );
    registry.register(
        PluginKind::RateLimitKeyGen,
        "path",
        Arc::new(|_options| Ok(PluginHandler::KeyGen(Arc::new(PathKeyGen)))),
    );
}

struct Window {
    started_at: Instant,
    count: u32,
}

/// The per-API limiter: fixed windows keyed by the generator's output
pub struct RateLimitStage {
    api: String,
    max: u32,
    window: Duration,
    keygen: Arc<dyn KeyGenerator>,
    windows: DashMap<String, Window>,
}

impl RateLimitStage {
    /// Build the stage, resolving the keygen plug-in. An unknown keygen
    /// id skips the whole stage (logged by the caller via the error).
    pub fn from_config(
        config: &RateLimitConfig,
        api: &str,
        registry: &PluginRegistry,
    ) -> crate::core::error::GatewayResult<Self> {
        let keygen_name = config.key_gen.as_deref().unwrap_or("ip");
        let keygen = registry.load_keygen(&PluginReference::named(keygen_name))?;

        Ok(Self {
            api: api.to_string(),
            max: config.max,
            window: Duration::from_millis(config.window),
            keygen,
            windows: DashMap::new(),
        })
    }

    /// Count one request against `key`; `false` when over the limit
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(window.started_at) >= self.window {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.max {
            return false;
        }
        window.count += 1;
        true
    }
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        "Too many requests, please try again later.",
    )
        .into_response()
}

pub async fn run_stage(stage: Arc<RateLimitStage>, req: Request, next: Next) -> Response {
    let key = stage.keygen.key(&req);

    if !stage.allow(&key) {
        debug!(api = %stage.api, key = %key, "rate limit exceeded");
        return too_many_requests();
    }

    next.run(req).await
}

/// Build the stage or log why it cannot be installed
pub fn resolve_stage(
    config: &RateLimitConfig,
    api: &str,
    registry: &PluginRegistry,
) -> Option<Arc<RateLimitStage>> {
    match RateLimitStage::from_config(config, api, registry) {
        Ok(stage) => Some(Arc::new(stage)),
        Err(err) => {
            error!(api = %api, error = %err, "skipping rate limit stage");
            None
        }
    }
}
