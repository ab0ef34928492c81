//! # Upstream Proxy Stage
//!
//! The innermost stage of every pipeline: forwards the (prefix-stripped)
//! request to the configured upstream and streams the response back.
//! Method and path are never rewritten beyond the mount stripping; the
//! gateway only adds identification headers. The response returned here
//! is the completion signal the breaker stage observes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestLog;

/// Maximum buffered request body size
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Hop-by-hop headers that must not cross the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug)]
pub struct ProxyStage {
    api: String,
    client: reqwest::Client,
    /// Normalized upstream base, no trailing slash
    target: String,
    methods: Option<HashSet<Method>>,
}

impl ProxyStage {
    pub fn from_config(
        client: reqwest::Client,
        config: &ProxyConfig,
        api: &str,
    ) -> GatewayResult<Self> {
        // Parse once so a bad target fails the API at configure time
        let parsed = reqwest::Url::parse(&config.target)
            .map_err(|e| GatewayError::config(format!("invalid proxy target {:?}: {e}", config.target)))?;
        if !parsed.has_host() {
            return Err(GatewayError::config(format!(
                "proxy target {:?} has no host",
                config.target
            )));
        }

        let methods = match &config.methods {
            Some(list) => {
                let mut set = HashSet::new();
                for name in list {
                    let method = name.parse::<Method>().map_err(|_| {
                        GatewayError::config(format!("invalid proxy method {name:?}"))
                    })?;
                    set.insert(method);
                }
                Some(set)
            }
            None => None,
        };

        Ok(Self {
            api: api.to_string(),
            client,
            target: config.target.trim_end_matches('/').to_string(),
            methods,
        })
    }

    fn allow_header(&self) -> String {
        let mut names: Vec<&str> = self
            .methods
            .iter()
            .flatten()
            .map(|m| m.as_str())
            .collect();
        names.sort_unstable();
        names.join(", ")
    }

    fn request_headers(&self, req: &Request) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in req.headers() {
            let lowered = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lowered.as_str())
                || lowered == "host"
                || lowered == "content-length"
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        // Identification headers; method and path stay untouched
        let request_id = req
            .extensions()
            .get::<RequestLog>()
            .map(|log| log.id().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(HeaderName::from_static("x-gateway-request-id"), value);
        }

        if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            let forwarded = match req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{existing}, {}", addr.ip()),
                None => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }

        headers
    }

    /// Forward one request and stream the upstream response back
    pub async fn handle(self: Arc<Self>, req: Request) -> Response {
        if let Some(allowed) = &self.methods {
            if !allowed.contains(req.method()) {
                let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
                if let Ok(value) = HeaderValue::from_str(&self.allow_header()) {
                    response.headers_mut().insert(axum::http::header::ALLOW, value);
                }
                return response;
            }
        }

        let mut upstream_url = format!("{}{}", self.target, req.uri().path());
        if let Some(query) = req.uri().query() {
            upstream_url.push('?');
            upstream_url.push_str(query);
        }

        let method = req.method().clone();
        let headers = self.request_headers(&req);

        let body: bytes::Bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY_SIZE).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(api = %self.api, error = %err, "failed to read request body");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };

        debug!(api = %self.api, method = %method, url = %upstream_url, "forwarding to upstream");

        let mut builder = self.client.request(method, &upstream_url).headers(headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let upstream = match builder.send().await {
            Ok(upstream) => upstream,
            Err(err) => {
                error!(api = %self.api, url = %upstream_url, error = %err, "upstream request failed");
                return GatewayError::Upstream(err).into_response();
            }
        };

        let status = upstream.status();
        let response_headers: Vec<(HeaderName, HeaderValue)> = upstream
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str().to_ascii_lowercase().as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        for (name, value) in response_headers {
            response.headers_mut().append(name, value);
        }
        response
    }
}
