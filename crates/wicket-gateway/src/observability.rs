//! Probe endpoints and the metrics exposition.
//!
//! - `/livez`: the process is up.
//! - `/readyz`: the gateway can usefully serve traffic (table published, no
//!   open breaker, at least one healthy upstream when any are monitored).
//! - `/startupz`: the first rebuild attempt has completed, published or not.
//! - `/health`: the detailed operator report.
//! - `/metrics`: Prometheus text format.

use crate::engine::Gateway;
use crate::responses;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use http::{header, StatusCode};
use serde_json::json;
use std::sync::Arc;
use wicket_metrics::{HealthReport, MemoryReport, ProcessReport, UpstreamReport};

pub async fn livez(State(gateway): State<Arc<Gateway>>) -> Response {
    (
        StatusCode::OK,
        axum::Json(json!({
            "status": "alive",
            "timestamp": responses::timestamp(),
            "pid": std::process::id(),
            "uptime_seconds": gateway.uptime_seconds(),
        })),
    )
        .into_response()
}

pub async fn readyz(State(gateway): State<Arc<Gateway>>) -> Response {
    let table_published = gateway.supervisor.is_published();
    let breakers_ok = !gateway.breakers.any_open();
    let upstreams_ok = gateway.health.monitored_count() == 0 || gateway.health.any_healthy();

    let checks = json!({
        "routing_table": table_published,
        "circuit_breakers": breakers_ok,
        "upstreams": upstreams_ok,
    });

    if table_published && breakers_ok && upstreams_ok {
        (
            StatusCode::OK,
            axum::Json(json!({
                "status": "ready",
                "timestamp": responses::timestamp(),
                "checks": checks,
            })),
        )
            .into_response()
    } else {
        let mut issues = Vec::new();
        if !table_published {
            issues.push("no routing table published");
        }
        if !breakers_ok {
            issues.push("one or more circuit breakers are open");
        }
        if !upstreams_ok {
            issues.push("no monitored upstream is healthy");
        }
        (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "status": "not_ready",
                "timestamp": responses::timestamp(),
                "checks": checks,
                "issues": issues,
            })),
        )
            .into_response()
    }
}

pub async fn startupz(State(gateway): State<Arc<Gateway>>) -> Response {
    if gateway.supervisor.startup_complete() {
        (
            StatusCode::OK,
            axum::Json(json!({
                "status": "started",
                "timestamp": responses::timestamp(),
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "status": "starting",
                "timestamp": responses::timestamp(),
            })),
        )
            .into_response()
    }
}

pub async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    let breaker_states = gateway.breakers.states();
    let any_open = breaker_states
        .values()
        .any(|s| *s == crate::breaker::BreakerState::Open);

    let health_snapshot = gateway.health.snapshot();
    let any_unhealthy = health_snapshot.values().any(|s| !s.healthy);

    let degraded = any_open || any_unhealthy;
    let report = HealthReport {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        timestamp: responses::timestamp(),
        memory: MemoryReport::sample(),
        circuit_breakers: breaker_states
            .into_iter()
            .map(|(upstream, state)| (upstream, state.as_str().to_string()))
            .collect(),
        upstreams: health_snapshot
            .into_iter()
            .map(|(origin, state)| {
                (
                    origin,
                    UpstreamReport {
                        healthy: state.healthy,
                        consecutive_failures: state.consecutive_failures,
                        consecutive_successes: state.consecutive_successes,
                    },
                )
            })
            .collect(),
        process: ProcessReport {
            pid: std::process::id(),
            uptime_seconds: gateway.uptime_seconds(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };

    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, axum::Json(report)).into_response()
}

pub async fn metrics(State(gateway): State<Arc<Gateway>>) -> Response {
    // Re-assert every gauge so a scrape sees current states even if no
    // transition fired since the last table rebuild.
    for (upstream, state) in gateway.breakers.states() {
        gateway
            .metrics
            .set_breaker_state(&upstream, state.metric_code());
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        gateway.metrics.encode(),
    )
        .into_response()
}
