//! # Gateway Server
//!
//! Owns the HTTP listener, the route table and the lifecycle. `configure`
//! is the only operation that mutates the route table: it builds fresh
//! per-API pipelines and swaps the whole router atomically, so in-flight
//! requests keep the structures they started with. A configure error on
//! one API is logged and does not abort the others.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tower::util::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::StrategyRegistrations;
use crate::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::pipeline::{build_api_router, PipelineContext};
use crate::plugins::PluginRegistry;
use crate::state::{MemoryStateStore, StateStore};

/// The gateway: shared wiring plus the swappable route table.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    store: Arc<dyn StateStore>,
    registry: Arc<PluginRegistry>,
    client: reqwest::Client,

    /// Current route table; replaced whole on configure
    routes: RwLock<Router>,

    /// Serializes configure against itself and remembers which API paths
    /// have breaker state already (reconfigure resets it)
    configured_paths: Mutex<HashSet<String>>,

    registrations: StrategyRegistrations,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Wire a gateway from an explicit store and plug-in registry
    pub fn new(store: Arc<dyn StateStore>, registry: Arc<PluginRegistry>) -> GatewayResult<Self> {
        // The gateway forwards responses verbatim, so upstream redirects
        // pass through instead of being followed
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(GatewayInner {
                store,
                registry,
                client,
                routes: RwLock::new(Router::new()),
                configured_paths: Mutex::new(HashSet::new()),
                registrations: StrategyRegistrations::new(),
                shutdown,
            }),
        })
    }

    /// In-process store and built-in plug-ins
    pub fn with_defaults() -> GatewayResult<Self> {
        Self::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(PluginRegistry::with_builtins()),
        )
    }

    /// The shared state store, for operational tooling and tests
    pub fn store(&self) -> Arc<dyn StateStore> {
        self.inner.store.clone()
    }

    /// The plug-in registry, for registering deployment-specific handlers
    /// before `configure`
    pub fn registry(&self) -> Arc<PluginRegistry> {
        self.inner.registry.clone()
    }

    /// Build all per-API pipelines from `config` and swap the route
    /// table. Serialized against concurrent configures.
    pub async fn configure(&self, config: GatewayConfig) -> GatewayResult<()> {
        let mut configured_paths = self.inner.configured_paths.lock().await;

        let ctx = PipelineContext {
            registry: &self.inner.registry,
            store: &self.inner.store,
            client: &self.inner.client,
            pipeline: &config.pipeline,
            registrations: &self.inner.registrations,
        };

        let mut root = Router::new();
        let mut mounted: HashSet<String> = HashSet::new();
        for api in &config.apis {
            if mounted.contains(&api.path) {
                error!(api = %api.path, "duplicate api path, skipping later definition");
                continue;
            }

            match build_api_router(api, &ctx) {
                Ok(api_router) => {
                    let outcome = if configured_paths.contains(&api.path) {
                        self.inner.store.reset(&api.path).await
                    } else {
                        self.inner.store.ensure(&api.path).await
                    };
                    if let Err(err) = outcome {
                        warn!(api = %api.path, error = %err, "could not initialize breaker state");
                    }

                    root = root.nest(&api.path, api_router);
                    mounted.insert(api.path.clone());
                    configured_paths.insert(api.path.clone());
                    info!(api = %api.path, target = %api.proxy.target, "mounted api pipeline");
                }
                Err(err) => {
                    error!(api = %api.path, error = %err, "failed to build api pipeline, skipping");
                }
            }
        }

        *self.inner.routes.write().await = root;
        info!(apis = mounted.len(), "gateway configured");
        Ok(())
    }

    /// Load the configuration document and configure
    pub async fn configure_from_file<P: AsRef<Path>>(&self, path: P) -> GatewayResult<()> {
        let config = GatewayConfig::from_file(path)?;
        self.configure(config).await
    }

    /// A clone of the current route table (integration tests drive this
    /// directly without a listener)
    pub async fn router(&self) -> Router {
        self.inner.routes.read().await.clone()
    }

    /// Bind `addr` and serve until [`Gateway::stop`]
    pub async fn start(&self, addr: SocketAddr) -> GatewayResult<()> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            GatewayError::config(format!("failed to bind gateway listener on {addr}: {e}"))
        })?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until [`Gateway::stop`],
    /// draining in-flight requests on shutdown
    pub async fn serve(&self, listener: TcpListener) -> GatewayResult<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "gateway listening");

        let app = Router::new()
            .fallback(dispatch)
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http());

        let mut shutdown = self.inner.shutdown.subscribe();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        })
        .await?;

        info!(%addr, "gateway stopped");
        Ok(())
    }

    /// Signal the listener to close and drain in-flight requests
    pub fn stop(&self) {
        // send_replace so a stop issued before serve still takes effect
        self.inner.shutdown.send_replace(true);
    }
}

/// Route every connection through the current route table. Reading the
/// table per request is what makes the configure swap atomic from the
/// client's point of view.
async fn dispatch(State(gateway): State<Gateway>, req: Request) -> Response {
    let router = gateway.router().await;
    match router.oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BreakerState;

    fn config(yaml: &str) -> GatewayConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_configure_skips_broken_api_keeps_others() {
        let gateway = Gateway::with_defaults().unwrap();

        gateway
            .configure(config(
                r#"
apis:
  - path: /broken
    proxy:
      target: "not a url"
  - path: /ok
    proxy:
      target: http://127.0.0.1:9000
"#,
            ))
            .await
            .unwrap();

        // Only the healthy API got breaker state
        let store = gateway.store();
        assert_eq!(
            store.get_state("/ok").await.unwrap().state,
            BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn test_reconfigure_resets_breaker_state() {
        let gateway = Gateway::with_defaults().unwrap();
        let yaml = r#"
apis:
  - path: /api
    proxy:
      target: http://127.0.0.1:9000
"#;

        gateway.configure(config(yaml)).await.unwrap();
        gateway.store().increment_failures("/api").await.unwrap();

        gateway.configure(config(yaml)).await.unwrap();
        assert_eq!(gateway.store().get_state("/api").await.unwrap().failures, 0);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_harmless() {
        let gateway = Gateway::with_defaults().unwrap();
        gateway.stop();
    }
}
