//! # Request-Scoped Types
//!
//! Types carried on the request itself as it flows through a pipeline.
//! Per-request state lives here (via request extensions); shared state
//! lives in the state store. The request log record replaces the
//! original's response monkey-patching with an explicit, clonable handle
//! that any stage may annotate.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

/// Outcome recorded by an authentication stage
pub const AUTH_SUCCESS: &str = "success";
pub const AUTH_FAIL: &str = "fail";

/// Identity established by an authentication strategy
///
/// Inserted into the request extensions on success so later stages and the
/// proxy can see who the caller is.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Consumer/user identifier as reported by the strategy
    pub id: String,

    /// Name of the strategy that authenticated the request
    pub strategy: &'static str,
}

/// Per-request log record, shared between stages via request extensions.
///
/// Cloning is cheap (`Arc`); annotations from any stage land on the same
/// record, which the request-log stage emits once the response is ready.
#[derive(Debug, Clone)]
pub struct RequestLog {
    inner: Arc<RequestLogInner>,
}

#[derive(Debug)]
struct RequestLogInner {
    id: String,
    api: String,
    started_at: Instant,
    fields: Mutex<LogFields>,
}

#[derive(Debug, Default)]
struct LogFields {
    authentication: Option<&'static str>,
}

impl RequestLog {
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RequestLogInner {
                id: Uuid::new_v4().to_string(),
                api: api.into(),
                started_at: Instant::now(),
                fields: Mutex::new(LogFields::default()),
            }),
        }
    }

    /// Gateway-assigned request id, also forwarded upstream
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// API path prefix this request matched
    pub fn api(&self) -> &str {
        &self.inner.api
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.inner.started_at.elapsed().as_millis()
    }

    /// Record the authentication outcome (`success` or `fail`)
    pub fn mark_authentication(&self, outcome: &'static str) {
        self.inner.fields.lock().authentication = Some(outcome);
    }

    pub fn authentication(&self) -> Option<&'static str> {
        self.inner.fields.lock().authentication
    }
}
