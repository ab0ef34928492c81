//! # Error Handling Module
//!
//! Defines all error kinds the gateway can produce and their HTTP status
//! mapping. The taxonomy follows the recovery policy of the gateway:
//! configuration and loader errors are logged and the offending stage is
//! omitted, store errors fail open on the hot path, and only per-request
//! failures become client-visible responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::state::StoreError;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error kinds for the gateway
///
/// Each variant represents a different category of failure. The `#[error]`
/// attribute supplies the `Display` implementation used in logs and in the
/// client-facing error envelope.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or contradictory API/middleware configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A named plug-in could not be resolved in its kind namespace
    #[error("plug-in not found: {namespace}/{name}")]
    Loader {
        namespace: &'static str,
        name: String,
    },

    /// Authentication rejected by a strategy
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },

    /// Request rejected by the rate-limit stage
    #[error("rate limit exceeded for key {key}")]
    RateLimitExceeded { key: String },

    /// Circuit breaker is open for an API path
    #[error("circuit breaker open for {path}")]
    CircuitOpen { path: String },

    /// The breaker timer fired before the upstream responded
    #[error("upstream timed out after {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64 },

    /// Request method outside the proxy's allowlist
    #[error("method {method} not allowed")]
    MethodNotAllowed { method: String },

    /// Malformed client request, short-circuited before the proxy
    #[error("invalid request: {reason}")]
    Client { reason: String },

    /// Shared state store unavailable
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Transport-level failure talking to the upstream
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// I/O errors (listener binding, config file reads)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors for configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authentication error with a custom reason
    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Create a client error with a custom reason
    pub fn client<S: Into<String>>(reason: S) -> Self {
        Self::Client {
            reason: reason.into(),
        }
    }

    /// Map this error to the status code returned to the client
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::Client { .. } | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. }
            | Self::Loader { .. }
            | Self::Store(_)
            | Self::Io(_)
            | Self::Yaml(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// String tag identifying the error kind in the response envelope
    fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Loader { .. } => "loader_error",
            Self::Authentication { .. } => "authentication_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitOpen { .. } => "circuit_breaker_open",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::Client { .. } => "client_error",
            Self::Store(_) => "store_error",
            Self::Upstream(_) => "upstream_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
        }
    }
}

/// Convert errors that escape a stage into HTTP responses.
///
/// The breaker and rate-limit stages build their wire-compatible plain-text
/// rejections themselves; everything else gets this JSON envelope.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
