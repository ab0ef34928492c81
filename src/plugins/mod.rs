//! # Plug-in Registry
//!
//! Resolves named plug-ins to executable handlers. Handlers are registered
//! by id into a kind-keyed registry at startup and looked up by string
//! reference during pipeline assembly; an unknown name is a loader error,
//! which the assembler logs before skipping that single stage.
//!
//! Kind namespaces mirror the on-disk plug-in layout of the original
//! deployment model: `authentication/strategy/<name>`,
//! `circuitbreaker/handler/<name>`, `ratelimit/keygen/<name>`.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::auth::AuthStrategy;
use crate::breaker::BreakerEventHandler;
use crate::core::error::{GatewayError, GatewayResult};
use crate::ratelimit::KeyGenerator;

/// Kind-specific namespaces the registry resolves names within
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    AuthStrategy,
    BreakerHandler,
    RateLimitKeyGen,
}

impl PluginKind {
    pub fn namespace(&self) -> &'static str {
        match self {
            PluginKind::AuthStrategy => "authentication/strategy",
            PluginKind::BreakerHandler => "circuitbreaker/handler",
            PluginKind::RateLimitKeyGen => "ratelimit/keygen",
        }
    }
}

/// A name plus arbitrary options, as written in configuration
#[derive(Debug, Clone)]
pub struct PluginReference {
    pub name: String,
    pub options: Value,
}

impl PluginReference {
    pub fn new(name: impl Into<String>, options: Value) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }

    /// A bare name with no options
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }
}

/// A ready-to-use handler bound to its options
pub enum PluginHandler {
    Auth(Arc<dyn AuthStrategy>),
    BreakerEvent(Arc<dyn BreakerEventHandler>),
    KeyGen(Arc<dyn KeyGenerator>),
}

impl std::fmt::Debug for PluginHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginHandler::Auth(_) => f.write_str("PluginHandler::Auth(..)"),
            PluginHandler::BreakerEvent(_) => f.write_str("PluginHandler::BreakerEvent(..)"),
            PluginHandler::KeyGen(_) => f.write_str("PluginHandler::KeyGen(..)"),
        }
    }
}

/// Factory producing a handler from the reference's options
pub type PluginFactory = Arc<dyn Fn(&Value) -> GatewayResult<PluginHandler> + Send + Sync>;

/// Kind-keyed registry of plug-in factories
#[derive(Default)]
pub struct PluginRegistry {
    factories: DashMap<(PluginKind, String), PluginFactory>,
}

impl PluginRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in handler registered
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::auth::strategies::register_builtins(&registry);
        crate::breaker::register_builtin_handlers(&registry);
        crate::ratelimit::register_builtin_keygens(&registry);
        registry
    }

    pub fn register(&self, kind: PluginKind, name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert((kind, name.into()), factory);
    }

    /// Resolve `reference` within `kind`'s namespace and bind it to the
    /// reference's options
    pub fn load(&self, kind: PluginKind, reference: &PluginReference) -> GatewayResult<PluginHandler> {
        // Clone the factory out so it runs without holding the map shard
        let factory = self
            .factories
            .get(&(kind, reference.name.clone()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::Loader {
                namespace: kind.namespace(),
                name: reference.name.clone(),
            })?;

        factory(&reference.options)
    }

    pub fn load_auth_strategy(
        &self,
        reference: &PluginReference,
    ) -> GatewayResult<Arc<dyn AuthStrategy>> {
        match self.load(PluginKind::AuthStrategy, reference)? {
            PluginHandler::Auth(strategy) => Ok(strategy),
            _ => Err(GatewayError::config(format!(
                "plug-in {} did not produce an authentication strategy",
                reference.name
            ))),
        }
    }

    pub fn load_breaker_handler(
        &self,
        reference: &PluginReference,
    ) -> GatewayResult<Arc<dyn BreakerEventHandler>> {
        match self.load(PluginKind::BreakerHandler, reference)? {
            PluginHandler::BreakerEvent(handler) => Ok(handler),
            _ => Err(GatewayError::config(format!(
                "plug-in {} did not produce a breaker event handler",
                reference.name
            ))),
        }
    }

    pub fn load_keygen(&self, reference: &PluginReference) -> GatewayResult<Arc<dyn KeyGenerator>> {
        match self.load(PluginKind::RateLimitKeyGen, reference)? {
            PluginHandler::KeyGen(keygen) => Ok(keygen),
            _ => Err(GatewayError::config(format!(
                "plug-in {} did not produce a key generator",
                reference.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_name_is_loader_error() {
        let registry = PluginRegistry::new();

        let err = registry
            .load(PluginKind::AuthStrategy, &PluginReference::named("nope"))
            .unwrap_err();

        assert!(matches!(err, GatewayError::Loader { .. }));
        assert!(err.to_string().contains("authentication/strategy/nope"));
    }

    #[test]
    fn test_builtins_resolve() {
        let registry = PluginRegistry::with_builtins();

        assert!(registry
            .load_keygen(&PluginReference::named("ip"))
            .is_ok());
        assert!(registry
            .load_keygen(&PluginReference::named("path"))
            .is_ok());
        assert!(registry
            .load_breaker_handler(&PluginReference::named("log"))
            .is_ok());
        assert!(registry
            .load_auth_strategy(&PluginReference::new(
                "key-auth",
                serde_json::json!({"keys": {"secret": "tester"}}),
            ))
            .is_ok());
    }

    #[test]
    fn test_same_name_is_scoped_per_kind() {
        let registry = PluginRegistry::with_builtins();

        // "log" exists as a breaker handler, not as a keygen
        assert!(registry
            .load_keygen(&PluginReference::named("log"))
            .is_err());
    }
}
