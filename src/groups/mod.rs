//! # Group Matcher
//!
//! Compiles named request-predicate groups into per-request boolean
//! filters. A predicate matches when every stated field matches; a group
//! matches when any of its predicates matches; a filter built from a list
//! of group names allows a request when any named group matches.
//!
//! Predicates are pure functions of the request method and path as seen
//! inside the API mount (prefix already stripped). URL regexes are
//! compiled exactly as written; anchoring is the group definition's
//! business.

use std::sync::Arc;

use axum::http::Method;
use regex::Regex;
use tracing::warn;

use crate::config::{GroupConfig, PredicateConfig};
use crate::core::error::{GatewayError, GatewayResult};

/// One compiled predicate over method and path
#[derive(Debug)]
pub struct Predicate {
    method: Option<Method>,
    url: Option<Regex>,
}

impl Predicate {
    fn compile(config: &PredicateConfig) -> GatewayResult<Self> {
        let method = match &config.method {
            Some(m) => Some(m.parse::<Method>().map_err(|_| {
                GatewayError::config(format!("invalid predicate method {m:?}"))
            })?),
            None => None,
        };

        let url = match &config.url {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                GatewayError::config(format!("invalid predicate regex {pattern:?}: {e}"))
            })?),
            None => None,
        };

        Ok(Self { method, url })
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        if let Some(expected) = &self.method {
            if expected != method {
                return false;
            }
        }
        if let Some(pattern) = &self.url {
            if !pattern.is_match(path) {
                return false;
            }
        }
        true
    }
}

/// A named, compiled predicate group
#[derive(Debug)]
pub struct Group {
    pub name: String,
    predicates: Vec<Predicate>,
}

impl Group {
    pub fn compile(config: &GroupConfig) -> GatewayResult<Self> {
        let predicates = config
            .predicates
            .iter()
            .map(Predicate::compile)
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self {
            name: config.name.clone(),
            predicates,
        })
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.predicates.iter().any(|p| p.matches(method, path))
    }
}

/// Compile an API's group definitions, dropping (and logging) broken ones
pub fn compile_groups(configs: &[GroupConfig]) -> Vec<Arc<Group>> {
    configs
        .iter()
        .filter_map(|config| match Group::compile(config) {
            Ok(group) => Some(Arc::new(group)),
            Err(err) => {
                warn!(group = %config.name, error = %err, "dropping unusable group definition");
                None
            }
        })
        .collect()
}

/// Resolve a middleware entry's group names to the compiled groups, for
/// filtering and for logging. Unknown names are logged and ignored.
pub fn filter(groups: &[Arc<Group>], names: &[String]) -> Vec<Arc<Group>> {
    names
        .iter()
        .filter_map(|name| {
            let found = groups.iter().find(|g| g.name == *name).cloned();
            if found.is_none() {
                warn!(group = %name, "middleware entry references unknown group");
            }
            found
        })
        .collect()
}

/// Per-request allow filter: the union of the referenced groups
#[derive(Debug, Clone)]
pub struct GroupFilter {
    groups: Vec<Arc<Group>>,
}

impl GroupFilter {
    pub fn allows(&self, method: &Method, path: &str) -> bool {
        self.groups.iter().any(|g| g.matches(method, path))
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.name.as_str()).collect()
    }
}

/// Build the allow filter for a middleware entry.
///
/// `None` when the entry names no groups: the stage applies
/// unconditionally. An entry whose names resolve to zero groups gets a
/// filter that never allows, so the stage never applies.
pub fn build_allow_filter(groups: &[Arc<Group>], names: Option<&[String]>) -> Option<GroupFilter> {
    match names {
        None => None,
        Some(names) if names.is_empty() => None,
        Some(names) => Some(GroupFilter {
            groups: filter(groups, names),
        }),
    }
}
