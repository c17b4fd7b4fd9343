//! Prometheus metric families owned by one engine instance.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// Gauge encoding of breaker states: `0=closed, 1=open, 2=half_open`.
pub const BREAKER_CLOSED: i64 = 0;
pub const BREAKER_OPEN: i64 = 1;
pub const BREAKER_HALF_OPEN: i64 = 2;

/// All metric families the gateway exposes on `/metrics`.
///
/// Constructed once at engine wiring time and shared by reference; recording
/// is lock-free (prometheus counters are atomics underneath).
pub struct MetricsRegistry {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_request_errors_total: IntCounterVec,
    upstream_requests_total: IntCounterVec,
    upstream_request_duration_seconds: HistogramVec,
    circuit_breaker_state: IntGaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests handled"),
            &["method", "route", "status_code"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["method", "route", "status_code"],
        )?;
        let http_request_errors_total = IntCounterVec::new(
            Opts::new(
                "http_request_errors_total",
                "HTTP responses with status >= 400",
            ),
            &["method", "route", "status_code", "error_type"],
        )?;
        let upstream_requests_total = IntCounterVec::new(
            Opts::new("upstream_requests_total", "Forward attempts per upstream"),
            &["upstream", "status_code"],
        )?;
        let upstream_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "upstream_request_duration_seconds",
                "Upstream forward latency in seconds",
            ),
            &["upstream"],
        )?;
        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state per upstream (0=closed, 1=open, 2=half_open)",
            ),
            &["upstream"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_request_errors_total.clone()))?;
        registry.register(Box::new(upstream_requests_total.clone()))?;
        registry.register(Box::new(upstream_request_duration_seconds.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            http_request_errors_total,
            upstream_requests_total,
            upstream_request_duration_seconds,
            circuit_breaker_state,
        })
    }

    /// Records one completed client response.
    ///
    /// `route` is the matched path prefix, or a fixed label for unmatched /
    /// observability traffic so cardinality stays bounded.
    pub fn record_http(&self, method: &str, route: &str, status: u16, duration_secs: f64) {
        let status_label = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, route, &status_label])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, route, &status_label])
            .observe(duration_secs);
        if status >= 400 {
            let error_type = if status >= 500 {
                "server_error"
            } else {
                "client_error"
            };
            self.http_request_errors_total
                .with_label_values(&[method, route, &status_label, error_type])
                .inc();
        }
    }

    /// Records one forward attempt against an upstream.
    pub fn record_upstream(&self, upstream: &str, status_label: &str, duration_secs: f64) {
        self.upstream_requests_total
            .with_label_values(&[upstream, status_label])
            .inc();
        self.upstream_request_duration_seconds
            .with_label_values(&[upstream])
            .observe(duration_secs);
    }

    /// Sets the breaker-state gauge for an upstream.
    pub fn set_breaker_state(&self, upstream: &str, code: i64) {
        self.circuit_breaker_state
            .with_label_values(&[upstream])
            .set(code);
    }

    /// Drops the breaker gauge series for an upstream removed from the table.
    pub fn remove_upstream(&self, upstream: &str) {
        if let Err(err) = self.circuit_breaker_state.remove_label_values(&[upstream]) {
            warn!(%upstream, error = %err, "failed to drop breaker gauge series");
        }
    }

    /// Renders the Prometheus text exposition.
    pub fn encode(&self) -> String {
        let families = self.registry.gather();
        TextEncoder::new()
            .encode_to_string(&families)
            .unwrap_or_else(|err| {
                warn!(error = %err, "metrics encoding failed");
                String::new()
            })
    }
}
