//! # Built-in Authentication Strategies
//!
//! Three strategies ship with the gateway: `key-auth` (header API keys),
//! `basic` (RFC 7617) and `jwt` (HS256 bearer tokens). Each is constructed
//! from the entry's options by its registry factory; deployments add their
//! own strategies through the same registry.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Request;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::{unauthorized, AuthStrategy};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Principal;
use crate::plugins::{PluginHandler, PluginKind, PluginRegistry};

fn parse_options<T: DeserializeOwned + Default>(options: &Value) -> GatewayResult<T> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone())
        .map_err(|e| GatewayError::config(format!("invalid strategy options: {e}")))
}

fn header<'r>(req: &'r Request, name: &str) -> Option<&'r str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// API keys carried in a configurable header, mapped to consumer ids
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KeyAuthOptions {
    /// key -> consumer id
    pub keys: HashMap<String, String>,

    pub header: Option<String>,
}

pub struct KeyAuthStrategy {
    keys: HashMap<String, String>,
    header: String,
}

impl KeyAuthStrategy {
    pub fn from_options(options: &Value) -> GatewayResult<Self> {
        let options: KeyAuthOptions = parse_options(options)?;
        Ok(Self {
            keys: options.keys,
            header: options.header.unwrap_or_else(|| "x-api-key".to_string()),
        })
    }
}

impl AuthStrategy for KeyAuthStrategy {
    fn scheme(&self) -> &'static str {
        "key-auth"
    }

    fn authenticate<'life0, 'life1, 'async_trait>(
        &'life0 self,
        req: &'life1 Request,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = GatewayResult<Principal>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        let key = header(req, &self.header).map(|s| s.to_string());
        Box::pin(async move {
            let key = key.ok_or_else(|| unauthorized("missing api key"))?;

            match self.keys.get(&key) {
                Some(consumer) => Ok(Principal {
                    id: consumer.clone(),
                    strategy: "key-auth",
                }),
                None => Err(unauthorized("unknown api key")),
            }
        })
    }
}

/// HTTP Basic credentials checked against a configured user table
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BasicOptions {
    /// user -> password
    pub users: HashMap<String, String>,
}

pub struct BasicStrategy {
    users: HashMap<String, String>,
}

impl BasicStrategy {
    pub fn from_options(options: &Value) -> GatewayResult<Self> {
        let options: BasicOptions = parse_options(options)?;
        Ok(Self {
            users: options.users,
        })
    }
}

impl AuthStrategy for BasicStrategy {
    fn scheme(&self) -> &'static str {
        "basic"
    }

    fn authenticate<'life0, 'life1, 'async_trait>(
        &'life0 self,
        req: &'life1 Request,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = GatewayResult<Principal>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        let value = header(req, "authorization").map(|s| s.to_string());
        Box::pin(async move {
            let value = value.ok_or_else(|| unauthorized("missing authorization header"))?;

            let encoded = value
                .strip_prefix("Basic ")
                .ok_or_else(|| unauthorized("not basic credentials"))?;

            let decoded = BASE64
                .decode(encoded.trim())
                .map_err(|_| unauthorized("malformed basic credentials"))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| unauthorized("malformed basic credentials"))?;

            let (user, password) = decoded
                .split_once(':')
                .ok_or_else(|| unauthorized("malformed basic credentials"))?;

            match self.users.get(user) {
                Some(expected) if expected == password => Ok(Principal {
                    id: user.to_string(),
                    strategy: "basic",
                }),
                _ => Err(unauthorized("bad credentials")),
            }
        })
    }
}

/// HS256 bearer tokens; expiry is validated, issuer/audience when
/// configured
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct JwtOptions {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

pub struct JwtStrategy {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtStrategy {
    pub fn from_options(options: &Value) -> GatewayResult<Self> {
        let options: JwtOptions = parse_options(options)?;
        if options.secret.is_empty() {
            return Err(GatewayError::config("jwt strategy requires a secret"));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &options.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &options.audience {
            validation.set_audience(&[audience]);
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(options.secret.as_bytes()),
            validation,
        })
    }
}

impl AuthStrategy for JwtStrategy {
    fn scheme(&self) -> &'static str {
        "jwt"
    }

    fn authenticate<'life0, 'life1, 'async_trait>(
        &'life0 self,
        req: &'life1 Request,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = GatewayResult<Principal>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        let value = header(req, "authorization").map(|s| s.to_string());
        Box::pin(async move {
            let value = value.ok_or_else(|| unauthorized("missing authorization header"))?;

            let token = value
                .strip_prefix("Bearer ")
                .ok_or_else(|| unauthorized("not a bearer token"))?;

            let data =
                jsonwebtoken::decode::<Value>(token, &self.decoding_key, &self.validation)
                    .map_err(|e| unauthorized(format!("invalid token: {e}")))?;

            let subject = data
                .claims
                .get("sub")
                .and_then(|v| v.as_str())
                .ok_or_else(|| unauthorized("token has no subject"))?;

            Ok(Principal {
                id: subject.to_string(),
                strategy: "jwt",
            })
        })
    }
}

/// Register the built-in strategies into the kind-keyed registry
pub fn register_builtins(registry: &PluginRegistry) {
    registry.register(
        PluginKind::AuthStrategy,
        "key-auth",
        Arc::new(|options| {
            Ok(PluginHandler::Auth(Arc::new(KeyAuthStrategy::from_options(
                options,
            )?)))
        }),
    );
    registry.register(
        PluginKind::AuthStrategy,
        "basic",
        Arc::new(|options| {
            Ok(PluginHandler::Auth(Arc::new(BasicStrategy::from_options(
                options,
            )?)))
        }),
    );
    registry.register(
        PluginKind::AuthStrategy,
        "jwt",
        Arc::new(|options| {
            Ok(PluginHandler::Auth(Arc::new(JwtStrategy::from_options(
                options,
            )?)))
        }),
    );
}
