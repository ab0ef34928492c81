//! # Circuit Breaker
//!
//! Per-API-path circuit breaking in two layers: the state machine over the
//! shared state store ([`machine`]) and the request-wrapping stage plus
//! configuration resolution ([`middleware`]). All breaker instances
//! configured for one API path share the same stored state; they differ
//! only in which requests they gate through their group filters.

pub mod machine;
pub mod middleware;

use std::sync::Arc;

pub use machine::{
    BreakerEvent, BreakerEventHandler, BreakerObserver, BreakerOptions, CircuitBreaker,
};
pub use middleware::{resolve_breakers, BreakerStage};

use crate::plugins::{PluginHandler, PluginKind, PluginRegistry};

/// Register the built-in breaker event handlers
pub fn register_builtin_handlers(registry: &PluginRegistry) {
    registry.register(
        PluginKind::BreakerHandler,
        "log",
        Arc::new(|_options| {
            Ok(PluginHandler::BreakerEvent(Arc::new(
                machine::LogEventHandler,
            )))
        }),
    );
}
