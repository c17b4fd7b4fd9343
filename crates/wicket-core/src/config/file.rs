//! Route table configuration store.
//!
//! Parses the YAML gateway config into validated [`Route`] values. Validation
//! is per-route: a malformed route is rejected with a logged reason while the
//! remaining routes are still published. A document with zero valid routes is
//! a hard error so a reload can never wipe the table by accident.

use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use url::Url;

fn def_probe_path() -> String {
    "/health".to_string()
}

fn def_true() -> bool {
    true
}

/// Top-level shape of the configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    /// Informational only; echoed in the reload summary log.
    #[serde(default)]
    pub version: Option<String>,
    pub routes: Vec<RouteSpec>,
}

/// A single route as written in the file, before validation.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RouteSpec {
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub upstreams: UpstreamsField,
    #[serde(default = "def_probe_path")]
    pub health_probe_path: String,
    /// Per-route override; inherits the global upstream timeout when absent.
    #[serde(default)]
    pub request_timeout_ms: Option<i64>,
    #[serde(default = "def_true")]
    pub retry_enabled: bool,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub lb_strategy: Option<String>,
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

/// `upstreams` accepts either a single string or a sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UpstreamsField {
    One(String),
    Many(Vec<serde_yml::Value>),
    Other(serde_yml::Value),
}

impl Default for UpstreamsField {
    fn default() -> Self {
        UpstreamsField::Other(serde_yml::Value::Null)
    }
}

impl UpstreamsField {
    /// Normalizes the field to a list of candidate strings.
    ///
    /// A string becomes a one-element list, a sequence is filtered down to
    /// its string entries, and anything else yields an empty list.
    pub fn normalize(&self) -> Vec<String> {
        match self {
            UpstreamsField::One(s) => vec![s.clone()],
            UpstreamsField::Many(values) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            UpstreamsField::Other(_) => Vec::new(),
        }
    }
}

/// A plugin reference on a route: `(name, enabled, params)`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PluginSpec {
    pub name: String,
    #[serde(default = "def_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Load-balancing strategy for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbStrategy {
    RoundRobin,
    Random,
    HealthAware,
}

impl LbStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "round_robin" => Some(LbStrategy::RoundRobin),
            "random" => Some(LbStrategy::Random),
            "health_aware" => Some(LbStrategy::HealthAware),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LbStrategy::RoundRobin => "round_robin",
            LbStrategy::Random => "random",
            LbStrategy::HealthAware => "health_aware",
        }
    }
}

/// Global defaults inherited by routes that leave optional fields unset.
#[derive(Debug, Clone)]
pub struct RouteDefaults {
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// A validated, immutable route.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub path_prefix: String,
    pub upstreams: Vec<Url>,
    pub health_probe_path: String,
    pub request_timeout: Duration,
    pub retry_enabled: bool,
    pub max_retries: u32,
    pub lb_strategy: LbStrategy,
    pub plugins: Vec<PluginSpec>,
}

impl Route {
    /// Upstream origins as strings without a trailing slash.
    ///
    /// This is the identity the breaker registry and health monitor key by.
    pub fn upstream_origins(&self) -> Vec<String> {
        self.upstreams
            .iter()
            .map(|u| u.as_str().trim_end_matches('/').to_string())
            .collect()
    }
}

/// Validates one route spec, returning the rejection reason on failure.
fn validate_route(spec: &RouteSpec, defaults: &RouteDefaults) -> std::result::Result<Route, String> {
    if spec.path_prefix.trim().is_empty() {
        return Err("path_prefix must be a non-empty string".to_string());
    }
    if !spec.path_prefix.starts_with('/') {
        return Err(format!("path_prefix {:?} must start with '/'", spec.path_prefix));
    }

    let candidates = spec.upstreams.normalize();
    if candidates.is_empty() {
        return Err("upstreams must be a non-empty string or list of strings".to_string());
    }
    let mut upstreams = Vec::with_capacity(candidates.len());
    for raw in &candidates {
        let url = Url::parse(raw).map_err(|e| format!("upstream {:?}: {}", raw, e))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(format!("upstream {:?}: unsupported scheme {:?}", raw, other)),
        }
        if url.host_str().is_none() {
            return Err(format!("upstream {:?}: missing host", raw));
        }
        upstreams.push(url);
    }

    if spec.health_probe_path.trim().is_empty() {
        return Err("health_probe_path must not be empty".to_string());
    }

    let request_timeout = match spec.request_timeout_ms {
        None => defaults.request_timeout,
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        Some(ms) => return Err(format!("request_timeout_ms must be positive, got {}", ms)),
    };

    let max_retries = match spec.max_retries {
        None => defaults.max_retries,
        Some(n) if n >= 0 => n as u32,
        Some(n) => return Err(format!("max_retries must be non-negative, got {}", n)),
    };

    let lb_strategy = match &spec.lb_strategy {
        None => LbStrategy::HealthAware,
        Some(raw) => {
            LbStrategy::parse(raw).ok_or_else(|| format!("unknown lb_strategy {:?}", raw))?
        }
    };

    for plugin in &spec.plugins {
        if plugin.name.trim().is_empty() {
            return Err("plugin name must be a non-empty string".to_string());
        }
    }

    Ok(Route {
        path_prefix: spec.path_prefix.clone(),
        upstreams,
        health_probe_path: spec.health_probe_path.clone(),
        request_timeout,
        retry_enabled: spec.retry_enabled,
        max_retries,
        lb_strategy,
        plugins: spec.plugins.clone(),
    })
}

/// Parses and validates a configuration document.
///
/// Returns the informational version tag plus the surviving routes. Fails
/// only when the document cannot be parsed at all or no route survives
/// validation.
pub fn parse_routes(
    document: &str,
    defaults: &RouteDefaults,
) -> Result<(Option<String>, Vec<Route>)> {
    let config: FileConfig = serde_yml::from_str(document)?;

    let mut routes = Vec::with_capacity(config.routes.len());
    for (index, spec) in config.routes.iter().enumerate() {
        match validate_route(spec, defaults) {
            Ok(route) => routes.push(route),
            Err(reason) => {
                warn!(
                    route = index,
                    path_prefix = %spec.path_prefix,
                    %reason,
                    "rejecting invalid route"
                );
            }
        }
    }

    if routes.is_empty() {
        return Err(GatewayError::Config(
            "configuration contains no valid routes".to_string(),
        ));
    }

    Ok((config.version, routes))
}

/// Reads and parses the configuration file at `path`.
pub fn load_routes(path: &Path, defaults: &RouteDefaults) -> Result<(Option<String>, Vec<Route>)> {
    let document = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("read {}: {}", path.display(), e)))?;
    parse_routes(&document, defaults)
}
