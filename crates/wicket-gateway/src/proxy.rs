//! The proxying pipeline.
//!
//! For a matched route: run the plugin chain, pick an upstream (skipping
//! open breakers), rewrite the path, forward under the route's breaker and
//! timeout, and stream the response body back without buffering. Failures in
//! the retryable set trigger another selection with the failed upstream
//! excluded for this request where possible; the whole loop is bounded by
//! the route's request timeout.
//!
//! Once the response has been handed to the client the pipeline never
//! attempts another upstream: retries happen strictly before the first
//! response byte, and a mid-body upstream failure surfaces as a broken
//! client stream.

use crate::balancer;
use crate::engine::Gateway;
use crate::plugins::{PluginOutcome, RequestContext};
use crate::responses;
use crate::table::RouteEntry;
use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::{request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, warn};
use wicket_core::correlation;
use wicket_core::error::GatewayError;
use wicket_core::retry;

/// Hop-by-hop headers stripped in both directions.
const HOP_BY_HOP_HEADERS: [&str; 6] = [
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Why a forward attempt did not produce a usable response.
enum ForwardFailure {
    /// Transport error, circuit open, or no candidate at all.
    Error(GatewayError),
    /// The upstream answered with a 5xx; held so the last one can be passed
    /// through to the client when retries run out.
    ServerError(reqwest::Response),
}

impl ForwardFailure {
    fn is_retryable(&self) -> bool {
        match self {
            ForwardFailure::ServerError(_) => true,
            ForwardFailure::Error(GatewayError::CircuitOpen { .. }) => true,
            ForwardFailure::Error(err) => err.is_retryable_transport(),
        }
    }
}

/// Runs the full per-route pipeline and produces the client response.
pub async fn handle(
    gateway: Arc<Gateway>,
    entry: Arc<RouteEntry>,
    parts: Parts,
    body: Bytes,
    peer: SocketAddr,
    correlation_id: String,
) -> Response {
    let mut ctx = RequestContext {
        method: parts.method.clone(),
        uri: parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| parts.uri.path().to_string()),
        headers: parts.headers.clone(),
        correlation_id: correlation_id.clone(),
    };

    for plugin in &entry.plugins {
        match plugin.apply(&mut ctx).await {
            Ok(PluginOutcome::Continue) => {}
            Ok(PluginOutcome::Respond(response)) => return response,
            Err(err) => {
                error!(
                    correlation_id = %correlation_id,
                    plugin = plugin.name(),
                    error = %err,
                    "plugin failed"
                );
                return responses::internal_error(&err.to_string(), gateway.production());
            }
        }
    }

    forward_with_retries(gateway, entry, ctx, parts.uri, body, peer, correlation_id).await
}

async fn forward_with_retries(
    gateway: Arc<Gateway>,
    entry: Arc<RouteEntry>,
    ctx: RequestContext,
    uri: Uri,
    body: Bytes,
    peer: SocketAddr,
    correlation_id: String,
) -> Response {
    let route = &entry.route;
    let policy = gateway
        .settings
        .retry_policy()
        .clamped_for_request(if route.retry_enabled { route.max_retries } else { 0 });
    let failed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let attempt_op = |_attempt: u32| {
        let gateway = gateway.clone();
        let entry = entry.clone();
        let headers = ctx.headers.clone();
        let method = ctx.method.clone();
        let uri = uri.clone();
        let body = body.clone();
        let failed = failed.clone();
        let correlation_id = correlation_id.clone();
        async move {
            let route = &entry.route;

            // Candidates: drop open breakers; if that empties the set, fall
            // back to the full list (the breaker call below still gates the
            // actual forward). Upstreams that already failed this request
            // are excluded only while an alternative remains.
            let not_open: Vec<String> = entry
                .origins
                .iter()
                .filter(|o| !gateway.breakers.is_open(o))
                .cloned()
                .collect();
            let base = if not_open.is_empty() {
                entry.origins.clone()
            } else {
                not_open
            };
            let tried = failed.lock().unwrap().clone();
            let mut candidates: Vec<String> = base
                .iter()
                .filter(|o| !tried.contains(*o))
                .cloned()
                .collect();
            if candidates.is_empty() {
                candidates = base;
            }

            let origin = balancer::select(route.lb_strategy, &candidates, &entry.cursor, |o| {
                gateway.health.is_healthy(o)
            })
            .ok_or_else(|| {
                ForwardFailure::Error(GatewayError::NoUpstreamAvailable {
                    route: route.path_prefix.clone(),
                })
            })?
            .to_string();

            let started = Instant::now();
            let result = gateway
                .breakers
                .execute(
                    &origin,
                    || {
                        forward_once(
                            &gateway.proxy_client,
                            &origin,
                            &entry,
                            method,
                            &uri,
                            &headers,
                            body,
                            &peer,
                            &correlation_id,
                        )
                    },
                    |response: &reqwest::Response| response.status().as_u16() >= 500,
                )
                .await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    gateway
                        .metrics
                        .record_upstream(&origin, &status.to_string(), elapsed);
                    if status >= 500 {
                        failed.lock().unwrap().insert(origin);
                        Err(ForwardFailure::ServerError(response))
                    } else {
                        Ok(response)
                    }
                }
                Err(err) => {
                    // An open circuit never touched the network; everything
                    // else was a real attempt worth a metric sample.
                    if !matches!(err, GatewayError::CircuitOpen { .. }) {
                        gateway.metrics.record_upstream(&origin, "error", elapsed);
                    }
                    failed.lock().unwrap().insert(origin);
                    Err(ForwardFailure::Error(err))
                }
            }
        }
    };

    let on_retry = |attempt: u32, failure: &ForwardFailure, delay: std::time::Duration| {
        let reason = match failure {
            ForwardFailure::Error(err) => err.to_string(),
            ForwardFailure::ServerError(response) => {
                format!("upstream responded with {}", response.status())
            }
        };
        debug!(
            correlation_id = %correlation_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "retrying forward"
        );
    };

    // The retry loop as a whole may not exceed the route's timeout; a
    // deadline hit mid-attempt is a gateway timeout, not another retry.
    let outcome = tokio::time::timeout(
        route.request_timeout,
        retry::execute(&policy, attempt_op, ForwardFailure::is_retryable, on_retry),
    )
    .await;

    match outcome {
        Err(_elapsed) => {
            warn!(
                correlation_id = %correlation_id,
                method = %ctx.method,
                path = %uri.path(),
                timeout_ms = route.request_timeout.as_millis() as u64,
                "request deadline exceeded"
            );
            responses::gateway_timeout()
        }
        Ok(Ok(response)) => stream_upstream_response(response),
        // Retries exhausted on 5xx: the last upstream answer goes through
        // (it already counted as a breaker failure).
        Ok(Err(ForwardFailure::ServerError(response))) => stream_upstream_response(response),
        Ok(Err(ForwardFailure::Error(err))) => {
            error!(
                correlation_id = %correlation_id,
                method = %ctx.method,
                path = %uri.path(),
                error = %err,
                "forwarding failed"
            );
            match &err {
                GatewayError::CircuitOpen { .. } => responses::service_unavailable(&err.to_string()),
                GatewayError::NoUpstreamAvailable { .. } => {
                    responses::service_unavailable(&err.to_string())
                }
                GatewayError::UpstreamTimeout(_) => responses::gateway_timeout(),
                GatewayError::UpstreamTransport { .. } => responses::bad_gateway(&err.to_string()),
                _ => responses::internal_error(&err.to_string(), gateway.production()),
            }
        }
    }
}

/// One forward attempt against a selected upstream.
#[allow(clippy::too_many_arguments)]
async fn forward_once(
    client: &reqwest::Client,
    origin: &str,
    entry: &RouteEntry,
    method: http::Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
    peer: &SocketAddr,
    correlation_id: &str,
) -> wicket_core::error::Result<reqwest::Response> {
    let target = build_target_url(origin, &entry.route.path_prefix, uri);

    let mut out_headers = filter_request_headers(headers);
    append_forwarded_for(&mut out_headers, peer);
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        out_headers.insert(HeaderName::from_static(correlation::RESPONSE_HEADER), value);
    }

    client
        .request(method, &target)
        .headers(out_headers)
        .body(body)
        .timeout(entry.route.request_timeout)
        .send()
        .await
        .map_err(GatewayError::from_reqwest)
}

/// Strips the route prefix and splices the suffix onto the upstream origin.
fn build_target_url(origin: &str, prefix: &str, uri: &Uri) -> String {
    let path = uri.path();
    let suffix = path.strip_prefix(prefix).unwrap_or("");
    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    if suffix.is_empty() {
        format!("{origin}/{query}")
    } else if suffix.starts_with('/') {
        format!("{origin}{suffix}{query}")
    } else {
        format!("{origin}/{suffix}{query}")
    }
}

/// Drops hop-by-hop headers, `Proxy-*`, and the fields the client set for
/// *us* (`Host`, `Content-Length`) rather than for the upstream.
fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lowered = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lowered)
            || lowered.starts_with("proxy-")
            || lowered == "host"
            || lowered == "content-length"
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Appends the peer address to `X-Forwarded-For`.
fn append_forwarded_for(headers: &mut HeaderMap, peer: &SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Turns the upstream response into a client response, streaming the body.
fn stream_upstream_response(upstream: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(out_headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            let lowered = name.as_str();
            if HOP_BY_HOP_HEADERS.contains(&lowered) || lowered.starts_with("proxy-") {
                continue;
            }
            out_headers.append(name.clone(), value.clone());
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_default()
}
