//! The immutable routing table.
//!
//! A table is built once per successful reconfiguration and published by the
//! router supervisor through an atomic pointer swap. Request handlers hold an
//! `Arc` to the table they matched against, so in-flight requests keep using
//! the table they started with even while a newer one is live.

use crate::balancer::LbCursor;
use crate::plugins::Plugin;
use std::collections::HashSet;
use std::sync::Arc;
use wicket_core::Route;

/// One route plus its materialized runtime companions.
pub struct RouteEntry {
    pub route: Route,
    /// Upstream origins (scheme://host[:port]) in config order.
    pub origins: Vec<String>,
    /// Enabled plugins, instantiated, in config order.
    pub plugins: Vec<Arc<dyn Plugin>>,
    /// Per-route load-balancer cursor; the only mutable state in the table.
    pub cursor: LbCursor,
}

impl RouteEntry {
    pub fn new(route: Route, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let origins = route.upstream_origins();
        Self {
            route,
            origins,
            plugins,
            cursor: LbCursor::new(),
        }
    }
}

/// Ordered route set published to the data plane.
pub struct RoutingTable {
    pub version: Option<String>,
    routes: Vec<Arc<RouteEntry>>,
}

impl RoutingTable {
    pub fn new(version: Option<String>, routes: Vec<Arc<RouteEntry>>) -> Self {
        Self { version, routes }
    }

    /// Longest-prefix match over the request path.
    pub fn match_route(&self, path: &str) -> Option<Arc<RouteEntry>> {
        self.routes
            .iter()
            .filter(|e| path.starts_with(&e.route.path_prefix))
            .max_by_key(|e| e.route.path_prefix.len())
            .cloned()
    }

    pub fn routes(&self) -> &[Arc<RouteEntry>] {
        &self.routes
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.routes.iter().map(|e| e.route.path_prefix.as_str()).collect()
    }

    /// Every distinct upstream origin referenced by the table.
    pub fn upstream_origins(&self) -> HashSet<String> {
        self.routes
            .iter()
            .flat_map(|e| e.origins.iter().cloned())
            .collect()
    }
}
