//! End-to-end tests for the data plane: real sockets, in-process upstreams,
//! the full middleware stack.

mod support;

use serde_json::Value;
use std::time::Duration;
use support::*;

async fn get_json(url: &str) -> (reqwest::StatusCode, Value) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status();
    let body = response.json().await.unwrap();
    (status, body)
}

// ============================================================================
// Healthy proxying
// ============================================================================

#[tokio::test]
async fn test_healthy_proxy_round_trip() {
    let upstream = echo_upstream().await;
    let config = format!(
        "routes:\n  - path_prefix: /api/products\n    upstreams: {}\n",
        upstream.origin()
    );
    let gw = start_gateway(&config, |_| {}).await;

    let response = reqwest::get(gw.url("/api/products/42?page=2")).await.unwrap();
    assert_eq!(response.status(), 200);
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(!request_id.is_empty());

    let body: Value = response.json().await.unwrap();
    // Prefix stripped, query preserved, Host rewritten to the upstream.
    assert_eq!(body["path"], "/42?page=2");
    assert_eq!(body["method"], "GET");
    assert_eq!(body["host"], upstream.addr.to_string());
    // Correlation id travels to the upstream; peer lands in X-Forwarded-For.
    assert_eq!(body["x-request-id"], request_id.as_str());
    assert_eq!(body["x-forwarded-for"], "127.0.0.1");
    // Hop-by-hop headers do not cross the proxy.
    assert_eq!(body["connection"], Value::Null);

    assert_eq!(upstream.hit_count(), 1);

    let metrics = reqwest::get(gw.url("/metrics")).await.unwrap().text().await.unwrap();
    assert!(metrics.contains(
        r#"http_requests_total{method="GET",route="/api/products",status_code="200"} 1"#
    ));
    assert!(metrics.contains("upstream_requests_total"));
}

#[tokio::test]
async fn test_client_supplied_correlation_id_is_preserved() {
    let upstream = echo_upstream().await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {}\n",
        upstream.origin()
    );
    let gw = start_gateway(&config, |_| {}).await;

    let response = reqwest::Client::new()
        .get(gw.url("/api/x"))
        .header("x-correlation-id", "corr-abc-123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "corr-abc-123");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["x-request-id"], "corr-abc-123");
}

// ============================================================================
// Matching and configuration state
// ============================================================================

#[tokio::test]
async fn test_unmatched_path_is_404() {
    let upstream = echo_upstream().await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {}\n",
        upstream.origin()
    );
    let gw = start_gateway(&config, |_| {}).await;

    let (status, body) = get_json(&gw.url("/elsewhere")).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "Not Found");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_unconfigured_gateway_responds_503() {
    let gw = start_unconfigured_gateway(|_| {}).await;
    let (status, body) = get_json(&gw.url("/anything")).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "Gateway not configured");
}

#[tokio::test]
async fn test_longest_prefix_routing() {
    let general = echo_upstream().await;
    let orders = fixed_status_upstream(201).await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {}\n  - path_prefix: /api/orders\n    upstreams: {}\n",
        general.origin(),
        orders.origin()
    );
    let gw = start_gateway(&config, |_| {}).await;

    let response = reqwest::get(gw.url("/api/orders/1")).await.unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(orders.hit_count(), 1);
    assert_eq!(general.hit_count(), 0);
}

// ============================================================================
// Global middleware
// ============================================================================

#[tokio::test]
async fn test_security_headers_present() {
    let gw = start_unconfigured_gateway(|_| {}).await;
    let response = reqwest::get(gw.url("/livez")).await.unwrap();
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(response.headers()["x-frame-options"], "SAMEORIGIN");
    assert_eq!(
        response.headers()["strict-transport-security"],
        "max-age=31536000"
    );
}

#[tokio::test]
async fn test_rate_limit_enforced_with_retry_after() {
    let upstream = echo_upstream().await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {}\n",
        upstream.origin()
    );
    let gw = start_gateway(&config, |s| s.rate_limit_max = 2).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        assert_eq!(client.get(gw.url("/api/x")).send().await.unwrap().status(), 200);
    }
    let response = client.get(gw.url("/api/x")).send().await.unwrap();
    assert_eq!(response.status(), 429);
    assert_eq!(response.headers()["retry-after"], "60");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["retryAfter"], 60);
    assert_eq!(upstream.hit_count(), 2);
}

#[tokio::test]
async fn test_observability_paths_are_never_rate_limited() {
    let gw = start_unconfigured_gateway(|s| s.rate_limit_max = 1).await;
    for _ in 0..10 {
        assert_eq!(reqwest::get(gw.url("/livez")).await.unwrap().status(), 200);
    }
}

#[tokio::test]
async fn test_oversized_body_is_413() {
    let upstream = echo_upstream().await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {}\n",
        upstream.origin()
    );
    let gw = start_gateway(&config, |s| s.request_body_limit = 16).await;

    let response = reqwest::Client::new()
        .post(gw.url("/api/upload"))
        .body(vec![0u8; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
    assert_eq!(upstream.hit_count(), 0);
}

#[tokio::test]
async fn test_global_deadline_produces_504() {
    let upstream = slow_upstream(Duration::from_secs(3), "slow").await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {}\n    retry_enabled: false\n",
        upstream.origin()
    );
    let gw = start_gateway(&config, |s| {
        s.request_timeout = Duration::from_millis(300);
    })
    .await;

    let response = reqwest::get(gw.url("/api/slow")).await.unwrap();
    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Gateway Timeout");
}

#[tokio::test]
async fn test_per_route_timeout_produces_504() {
    let upstream = slow_upstream(Duration::from_secs(3), "slow").await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {}\n    request_timeout_ms: 200\n    retry_enabled: false\n",
        upstream.origin()
    );
    let gw = start_gateway(&config, |_| {}).await;

    let response = reqwest::get(gw.url("/api/slow")).await.unwrap();
    assert_eq!(response.status(), 504);
}

// ============================================================================
// Retries, failover, breakers
// ============================================================================

#[tokio::test]
async fn test_transport_errors_exhaust_retries_into_502() {
    let dead = refused_origin().await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {dead}\n    max_retries: 2\n"
    );
    let gw = start_gateway(&config, |_| {}).await;

    let (status, body) = get_json(&gw.url("/api/x")).await;
    assert_eq!(status, 502);
    assert_eq!(body["error"], "Bad Gateway");

    // max_retries = 2 means exactly 3 attempts against the one upstream.
    let metrics = reqwest::get(gw.url("/metrics")).await.unwrap().text().await.unwrap();
    assert!(metrics.contains(&format!(
        r#"upstream_requests_total{{status_code="error",upstream="{dead}"}} 3"#
    )));
}

#[tokio::test]
async fn test_5xx_is_retried_then_passed_through() {
    let upstream = fixed_status_upstream(500).await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {}\n    max_retries: 2\n",
        upstream.origin()
    );
    let gw = start_gateway(&config, |_| {}).await;

    let response = reqwest::get(gw.url("/api/x")).await.unwrap();
    // Retries exhausted: the upstream's own 500 reaches the client.
    assert_eq!(response.status(), 500);
    assert_eq!(upstream.hit_count(), 3);
}

#[tokio::test]
async fn test_health_aware_failover_prefers_healthy_upstream() {
    let dead = refused_origin().await;
    let live = echo_upstream().await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams:\n      - {dead}\n      - {}\n",
        live.origin()
    );
    let gw = start_gateway(&config, |s| {
        s.health_check_interval = Duration::from_millis(50);
        s.unhealthy_threshold = 1;
        s.healthy_threshold = 1;
    })
    .await;

    // Give the probe loop time to mark the dead upstream unhealthy.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!gw.gateway.health.is_healthy(&dead));

    for _ in 0..4 {
        let response = reqwest::get(gw.url("/api/x")).await.unwrap();
        assert_eq!(response.status(), 200);
    }
    assert_eq!(live.hit_count(), 4);
}

#[tokio::test]
async fn test_breaker_trips_after_error_threshold() {
    let upstream = fixed_status_upstream(500).await;
    let origin = upstream.origin();
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {origin}\n    retry_enabled: false\n"
    );
    let gw = start_gateway(&config, |_| {}).await;

    // Default breaker volume: 10 fires in the window, 100% failures.
    for _ in 0..10 {
        let response = reqwest::get(gw.url("/api/x")).await.unwrap();
        assert_eq!(response.status(), 500);
    }
    assert_eq!(upstream.hit_count(), 10);

    // Tripped: the next call is rejected without touching the upstream.
    let (status, body) = get_json(&gw.url("/api/x")).await;
    assert_eq!(status, 503);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("circuit breaker open"));
    assert_eq!(upstream.hit_count(), 10);

    // Readiness and the detailed report both go degraded.
    let response = reqwest::get(gw.url("/readyz")).await.unwrap();
    assert_eq!(response.status(), 503);
    let (status, body) = get_json(&gw.url("/health")).await;
    assert_eq!(status, 503);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["circuitBreakers"][&origin], "open");

    let metrics = reqwest::get(gw.url("/metrics")).await.unwrap().text().await.unwrap();
    assert!(metrics.contains(&format!(r#"circuit_breaker_state{{upstream="{origin}"}} 1"#)));
}

// ============================================================================
// Observability surface
// ============================================================================

#[tokio::test]
async fn test_probe_endpoints_on_healthy_gateway() {
    let upstream = echo_upstream().await;
    let config = format!(
        "routes:\n  - path_prefix: /api\n    upstreams: {}\n",
        upstream.origin()
    );
    let gw = start_gateway(&config, |_| {}).await;

    let (status, body) = get_json(&gw.url("/livez")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "alive");
    assert!(body["pid"].as_u64().unwrap() > 0);
    assert!(body.get("uptime_seconds").is_some());

    let (status, body) = get_json(&gw.url("/readyz")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["routing_table"], true);

    let (status, body) = get_json(&gw.url("/startupz")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "started");

    let (status, body) = get_json(&gw.url("/health")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert!(body["upstreams"][upstream.origin()].is_object());
    assert_eq!(body["circuitBreakers"][upstream.origin()], "closed");
}

#[tokio::test]
async fn test_readyz_and_startupz_before_first_rebuild() {
    let gw = start_unconfigured_gateway(|_| {}).await;

    let (status, body) = get_json(&gw.url("/readyz")).await;
    assert_eq!(status, 503);
    assert_eq!(body["checks"]["routing_table"], false);
    assert!(body["issues"]
        .as_array()
        .unwrap()
        .iter()
        .any(|i| i.as_str().unwrap().contains("routing table")));

    let (status, body) = get_json(&gw.url("/startupz")).await;
    assert_eq!(status, 503);
    assert_eq!(body["status"], "starting");
}
