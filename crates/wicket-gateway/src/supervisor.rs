//! Route-table lifecycle.
//!
//! The supervisor is the single writer of the published [`RoutingTable`].
//! A rebuild parses and validates the config file, resets the plugin cache,
//! materializes per-route plugin chains, diffs the upstream set against the
//! health monitor and breaker registry, and finally publishes the new table
//! with one atomic swap. Any failure along the way leaves the previous table
//! untouched.
//!
//! Rebuilding against an unchanged route model is a logged no-op: no monitor
//! restarts, no breaker resets, no republish.

use crate::breaker::BreakerRegistry;
use crate::health::HealthMonitor;
use crate::plugins::PluginRegistry;
use crate::table::{RouteEntry, RoutingTable};
use arc_swap::ArcSwapOption;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use wicket_core::config::{load_routes, Route, RouteDefaults};
use wicket_core::error::{GatewayError, Result};
use wicket_metrics::MetricsRegistry;

pub struct RouterSupervisor {
    config_path: PathBuf,
    defaults: RouteDefaults,
    table: ArcSwapOption<RoutingTable>,
    registry: Arc<PluginRegistry>,
    health: Arc<HealthMonitor>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<MetricsRegistry>,
    first_attempt_done: AtomicBool,
    /// The last successfully published route model, for idempotence checks.
    last_routes: Mutex<Option<Vec<Route>>>,
    /// Serializes rebuilds; readers never take this.
    rebuild_gate: tokio::sync::Mutex<()>,
}

impl RouterSupervisor {
    pub fn new(
        config_path: PathBuf,
        defaults: RouteDefaults,
        registry: Arc<PluginRegistry>,
        health: Arc<HealthMonitor>,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config_path,
            defaults,
            table: ArcSwapOption::const_empty(),
            registry,
            health,
            breakers,
            metrics,
            first_attempt_done: AtomicBool::new(false),
            last_routes: Mutex::new(None),
            rebuild_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// The currently published table, if any. Lock-free.
    pub fn current(&self) -> Option<Arc<RoutingTable>> {
        self.table.load_full()
    }

    pub fn is_published(&self) -> bool {
        self.table.load().is_some()
    }

    /// Whether at least one rebuild attempt has finished (success or not).
    pub fn startup_complete(&self) -> bool {
        self.first_attempt_done.load(Ordering::Relaxed)
    }

    /// Rebuilds the table from the config file.
    ///
    /// On any error the previous table stays published.
    pub async fn rebuild(&self) -> Result<()> {
        let _gate = self.rebuild_gate.lock().await;
        let result = self.rebuild_inner();
        self.first_attempt_done.store(true, Ordering::Relaxed);
        if let Err(err) = &result {
            error!(
                config = %self.config_path.display(),
                error = %err,
                "rebuild failed, keeping previous routing table"
            );
        }
        result
    }

    fn rebuild_inner(&self) -> Result<()> {
        let (version, routes) = load_routes(&self.config_path, &self.defaults)?;

        {
            let last = self.last_routes.lock().unwrap();
            if last.as_deref() == Some(routes.as_slice()) {
                info!("configuration unchanged, keeping current routing table");
                return Ok(());
            }
        }

        self.registry.reset();

        let mut entries: Vec<Arc<RouteEntry>> = Vec::with_capacity(routes.len());
        for route in &routes {
            match self.materialize(route) {
                Ok(entry) => entries.push(Arc::new(entry)),
                Err(err) => {
                    warn!(
                        path_prefix = %route.path_prefix,
                        error = %err,
                        "rejecting route, plugin chain could not be built"
                    );
                }
            }
        }
        if entries.is_empty() {
            return Err(GatewayError::Config(
                "no route survived plugin materialization".to_string(),
            ));
        }

        let table = RoutingTable::new(version.clone(), entries);
        let origins = table.upstream_origins();

        // New upstreams start monitored (optimistically healthy); removed
        // ones stop and are forgotten everywhere, gauge series included.
        for entry in table.routes() {
            for origin in &entry.origins {
                self.health.watch(origin, &entry.route.health_probe_path);
            }
        }
        self.health.retain(&origins);
        for removed in self.breakers.retain(&origins) {
            self.metrics.remove_upstream(&removed);
        }
        for origin in &origins {
            self.metrics
                .set_breaker_state(origin, self.breakers.state(origin).metric_code());
        }

        let prefixes: Vec<String> = table.prefixes().iter().map(|p| p.to_string()).collect();
        let route_count = table.route_count();

        self.table.store(Some(Arc::new(table)));
        *self.last_routes.lock().unwrap() = Some(routes);

        info!(
            route_count,
            version = version.as_deref().unwrap_or("-"),
            prefixes = ?prefixes,
            "published new routing table"
        );
        Ok(())
    }

    /// Instantiates the enabled plugins of one route.
    fn materialize(&self, route: &Route) -> Result<RouteEntry> {
        let mut plugins = Vec::new();
        for spec in &route.plugins {
            if !spec.enabled {
                continue;
            }
            plugins.push(self.registry.load(&spec.name, &spec.params)?);
        }
        Ok(RouteEntry::new(route.clone(), plugins))
    }
}
