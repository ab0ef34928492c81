//! # Configuration Model
//!
//! The declarative description of the gateway: a list of APIs, each with a
//! proxy target, optional predicate groups, and ordered middleware entries
//! (authentication, circuit breakers, rate limiting). A pipeline-level
//! document carries shared authentication entries referenced by `use`.
//!
//! Field names accept both snake_case and the camelCase wire names
//! (`resetTimeout`, `maxFailures`, ...) via serde aliases. Documents load
//! from YAML or JSON files.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{GatewayError, GatewayResult};

/// Top-level gateway configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// All configured APIs, each mounted under its `path` prefix
    #[serde(default)]
    pub apis: Vec<ApiConfig>,

    /// Pipeline-level shared entries
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Pipeline-level document: shared authentication entries keyed by id,
/// referenced from per-API entries through their `use` field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub authentication: HashMap<String, AuthenticationConfig>,
}

/// The authoritative description of one upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// URL prefix under which requests are matched (unique per gateway)
    pub path: String,

    /// Upstream proxy settings
    pub proxy: ProxyConfig,

    /// Named request-predicate groups referenced by middleware entries
    #[serde(default)]
    pub group: Vec<GroupConfig>,

    /// Ordered authentication entries
    #[serde(default)]
    pub authentication: Vec<AuthenticationConfig>,

    /// Circuit-breaker entries; all entries share one state per `path`
    #[serde(default, alias = "circuitBreaker")]
    pub circuit_breaker: Vec<CircuitBreakerConfig>,

    /// Optional rate-limit stage
    #[serde(default, alias = "rateLimit")]
    pub rate_limit: Option<RateLimitConfig>,

    /// Emit a structured log line per request
    #[serde(default = "default_true", alias = "requestLog")]
    pub request_log: bool,

    /// Emit per-request counters to the metrics sink
    #[serde(default = "default_true")]
    pub stats: bool,
}

/// Upstream target and local mount for one API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream base URL
    pub target: String,

    /// Local mount below the API prefix (stripped before forwarding)
    #[serde(default = "default_mount")]
    pub path: String,

    /// Optional HTTP method allowlist; requests outside it receive 405
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

/// A named set of request predicates used to scope middleware entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,

    #[serde(default)]
    pub predicates: Vec<PredicateConfig>,
}

/// One predicate: matches when every stated field matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateConfig {
    /// HTTP method, e.g. `GET`
    #[serde(default)]
    pub method: Option<String>,

    /// Path regex, anchored as written in the definition
    #[serde(default)]
    pub url: Option<String>,
}

/// One authentication entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    /// Strategy to load; may be omitted when `use` supplies it
    #[serde(default)]
    pub strategy: Option<StrategyConfig>,

    /// Group names scoping this entry; absent means catch-all (default)
    #[serde(default)]
    pub group: Option<Vec<String>>,

    /// Reference into `pipeline.authentication`; missing fields are
    /// defaulted against the referenced entry
    #[serde(default, rename = "use")]
    pub use_ref: Option<String>,
}

/// Named plug-in with arbitrary options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,

    #[serde(default)]
    pub options: Value,
}

/// One circuit-breaker entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Upstream completion deadline in milliseconds
    #[serde(default = "default_breaker_timeout")]
    pub timeout: u64,

    /// OPEN -> HALF_OPEN delay in milliseconds
    #[serde(default = "default_reset_timeout", alias = "resetTimeout")]
    pub reset_timeout: u64,

    /// Consecutive failures that open the breaker
    #[serde(default = "default_max_failures", alias = "maxFailures")]
    pub max_failures: u32,

    /// Group names scoping this entry; absent means catch-all (default)
    #[serde(default)]
    pub group: Option<Vec<String>>,

    /// Handler plug-in ids invoked on state transitions
    #[serde(default, alias = "onOpen")]
    pub on_open: Option<String>,

    #[serde(default, alias = "onClose")]
    pub on_close: Option<String>,

    #[serde(default, alias = "onRejected")]
    pub on_rejected: Option<String>,

    /// Suppress the counters sink for this breaker's events
    #[serde(default, alias = "disableStats")]
    pub disable_stats: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout: default_breaker_timeout(),
            reset_timeout: default_reset_timeout(),
            max_failures: default_max_failures(),
            group: None,
            on_open: None,
            on_close: None,
            on_rejected: None,
            disable_stats: false,
        }
    }
}

/// Rate-limit stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    #[serde(default = "default_rate_limit_max")]
    pub max: u32,

    /// Window length in milliseconds
    #[serde(default = "default_rate_limit_window", alias = "windowMs")]
    pub window: u64,

    /// Key-generator plug-in id (defaults to `ip`)
    #[serde(default, alias = "keyGen")]
    pub key_gen: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_mount() -> String {
    "/".to_string()
}

fn default_breaker_timeout() -> u64 {
    30_000
}

fn default_reset_timeout() -> u64 {
    120_000
}

fn default_max_failures() -> u32 {
    10
}

fn default_rate_limit_max() -> u32 {
    60
}

fn default_rate_limit_window() -> u64 {
    60_000
}

impl GatewayConfig {
    /// Load a configuration document from a YAML or JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => serde_yaml::from_str(&raw)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Structural validation independent of plug-in resolution
    pub fn validate(&self) -> GatewayResult<()> {
        for api in &self.apis {
            api.validate()?;
        }
        Ok(())
    }
}

impl ApiConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if !self.path.starts_with('/') || self.path == "/" {
            return Err(GatewayError::config(format!(
                "api path {:?} must be a non-root prefix starting with '/'",
                self.path
            )));
        }
        if !self.proxy.path.starts_with('/') {
            return Err(GatewayError::config(format!(
                "proxy path {:?} for api {} must start with '/'",
                self.proxy.path, self.path
            )));
        }
        Ok(())
    }
}

/// Middleware entries that may be scoped to groups.
///
/// An entry with no group names is the "default" (catch-all) entry of its
/// list; at most one is allowed per kind per API.
pub trait GroupScoped {
    fn group_names(&self) -> Option<&[String]>;

    fn is_default(&self) -> bool {
        self.group_names().map_or(true, |names| names.is_empty())
    }
}

impl GroupScoped for AuthenticationConfig {
    fn group_names(&self) -> Option<&[String]> {
        self.group.as_deref()
    }
}

impl GroupScoped for CircuitBreakerConfig {
    fn group_names(&self) -> Option<&[String]> {
        self.group.as_deref()
    }
}

/// Move the single default entry to the end of the list so group-scoped
/// entries are evaluated first and the default acts as a catch-all.
///
/// More than one default entry is a configuration error; callers log it
/// and install no stage of that kind.
pub fn sort_default_last<T: GroupScoped>(entries: Vec<T>, kind: &str) -> GatewayResult<Vec<T>> {
    let defaults = entries.iter().filter(|e| e.is_default()).count();
    if defaults > 1 {
        return Err(GatewayError::config(format!(
            "{defaults} default (group-less) {kind} entries configured, at most one is allowed"
        )));
    }

    let (scoped, default): (Vec<T>, Vec<T>) =
        entries.into_iter().partition(|e| !e.is_default());

    let mut sorted = scoped;
    sorted.extend(default);
    Ok(sorted)
}

/// Resolve an entry's `use` reference against the pipeline-level
/// authentication dictionary, defaulting missing fields from the
/// referenced entry. An unresolved reference is a fatal configuration
/// error for the stage.
pub fn resolve_use(
    entry: &AuthenticationConfig,
    shared: &HashMap<String, AuthenticationConfig>,
) -> GatewayResult<AuthenticationConfig> {
    let mut resolved = entry.clone();

    if let Some(reference) = &entry.use_ref {
        let base = shared.get(reference).ok_or_else(|| {
            GatewayError::config(format!(
                "authentication entry references unknown pipeline entry {reference:?}"
            ))
        })?;

        if resolved.strategy.is_none() {
            resolved.strategy = base.strategy.clone();
        }
        if resolved.group.is_none() {
            resolved.group = base.group.clone();
        }
    }

    if resolved.strategy.is_none() {
        return Err(GatewayError::config(
            "authentication entry has no strategy after use-resolution",
        ));
    }

    Ok(resolved)
}
