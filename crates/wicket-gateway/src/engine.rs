//! Engine wiring.
//!
//! One [`Gateway`] value per process owns every long-lived component
//! (breaker registry, health monitor, rate limiters, plugin registry,
//! router supervisor, metrics) and is threaded through the server frontend
//! and the proxy pipeline as shared state. There are no globals; tests
//! build as many engines as they like.

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::health::{HealthConfig, HealthMonitor};
use crate::plugins::PluginRegistry;
use crate::supervisor::RouterSupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use wicket_core::error::{GatewayError, Result};
use wicket_core::{RateLimitConfig, RateLimiter, Settings};
use wicket_metrics::MetricsRegistry;

/// One gateway engine instance.
pub struct Gateway {
    pub settings: Settings,
    pub metrics: Arc<MetricsRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub health: Arc<HealthMonitor>,
    /// Global fixed-window limiter.
    pub limiter: RateLimiter,
    /// Strict profile applied to auth-protected routes.
    pub strict_limiter: RateLimiter,
    pub registry: Arc<PluginRegistry>,
    pub supervisor: Arc<RouterSupervisor>,
    /// Pooled client for upstream forwards (keep-alive per origin).
    pub proxy_client: reqwest::Client,
    pub started_at: Instant,
}

impl Gateway {
    /// Builds and wires a full engine from validated settings.
    pub async fn new(settings: Settings) -> Result<Arc<Self>> {
        let metrics = Arc::new(
            MetricsRegistry::new()
                .map_err(|e| GatewayError::Internal(format!("metrics registry: {e}")))?,
        );

        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            window: settings.breaker_window,
            error_threshold_pct: settings.breaker_error_threshold_pct,
            reset_timeout: settings.breaker_reset_timeout,
            ..BreakerConfig::default()
        }));
        {
            // Breaker transitions feed the log and the state gauge.
            let metrics = metrics.clone();
            breakers.on_transition(Arc::new(move |upstream, state| {
                info!(%upstream, state = state.as_str(), "circuit breaker transition");
                metrics.set_breaker_state(upstream, state.metric_code());
            }));
        }

        let health = Arc::new(HealthMonitor::new(
            HealthConfig {
                interval: settings.health_check_interval,
                timeout: settings.health_check_timeout,
                unhealthy_threshold: settings.unhealthy_threshold,
                healthy_threshold: settings.healthy_threshold,
            },
            breakers.clone(),
        ));

        let limiter = RateLimiter::connect(
            RateLimitConfig::new(settings.rate_limit_window, settings.rate_limit_max),
            settings.rate_limit_store_url.as_deref(),
        )
        .await;
        let strict_limiter = limiter.sibling(RateLimitConfig::new(
            settings.rate_limit_window,
            settings.rate_limit_strict_max,
        ));

        let registry = Arc::new(PluginRegistry::builtin());
        let supervisor = Arc::new(RouterSupervisor::new(
            PathBuf::from(&settings.config_path),
            settings.route_defaults(),
            registry.clone(),
            health.clone(),
            breakers.clone(),
            metrics.clone(),
        ));

        let proxy_client = reqwest::Client::builder()
            .pool_max_idle_per_host(settings.max_free_sockets)
            .build()
            .map_err(|e| GatewayError::Internal(format!("proxy client: {e}")))?;

        Ok(Arc::new(Self {
            settings,
            metrics,
            breakers,
            health,
            limiter,
            strict_limiter,
            registry,
            supervisor,
            proxy_client,
            started_at: Instant::now(),
        }))
    }

    pub fn production(&self) -> bool {
        self.settings.mode.is_production()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Tears down background work during graceful shutdown: probes stop and
    /// the shared rate-limit store connection is released. Config rebuilds
    /// are ignored from here on because the watcher task is aborted by the
    /// host before calling this.
    pub async fn shutdown(&self) {
        self.health.stop_all();
        let _ = self.limiter.shutdown().await;
        let _ = self.strict_limiter.shutdown().await;
    }
}
