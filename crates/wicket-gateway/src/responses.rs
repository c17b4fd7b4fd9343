//! Canned JSON responses for the error surface.
//!
//! Every error body carries an ISO-8601 `timestamp` so client-side reports
//! can be lined up against gateway logs.

use axum::body::Body;
use axum::response::Response;
use chrono::{SecondsFormat, Utc};
use http::{header, HeaderValue, StatusCode};
use serde_json::json;

/// Current time as an ISO-8601 string with millisecond precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn json_body(status: StatusCode, body: serde_json::Value) -> Response {
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_default()
}

/// Generic `{error, message, timestamp}` body.
pub fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    json_body(
        status,
        json!({
            "error": error,
            "message": message,
            "timestamp": timestamp(),
        }),
    )
}

pub fn not_found(path: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "Not Found",
        &format!("no route matches {path}"),
    )
}

pub fn not_configured() -> Response {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "Gateway not configured",
        "no routing table has been published yet",
    )
}

pub fn payload_too_large(limit: usize) -> Response {
    error_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        "Payload Too Large",
        &format!("request body exceeds the {limit}-byte limit"),
    )
}

pub fn bad_gateway(message: &str) -> Response {
    error_response(StatusCode::BAD_GATEWAY, "Bad Gateway", message)
}

pub fn service_unavailable(message: &str) -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable", message)
}

/// The per-request deadline fired before any response was produced.
pub fn gateway_timeout() -> Response {
    let mut response = error_response(
        StatusCode::GATEWAY_TIMEOUT,
        "Gateway Timeout",
        "the request did not complete within the configured deadline",
    );
    // The connection is no longer in a usable state for this client.
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

/// 429 with the window length echoed in `Retry-After`.
pub fn rate_limited(window_secs: u64) -> Response {
    let mut response = json_body(
        StatusCode::TOO_MANY_REQUESTS,
        json!({
            "error": "Too Many Requests",
            "message": "rate limit exceeded for this client",
            "retryAfter": window_secs,
        }),
    );
    if let Ok(value) = HeaderValue::from_str(&window_secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

/// 500 whose message is suppressed in production mode.
pub fn internal_error(message: &str, production: bool) -> Response {
    let message = if production {
        "internal server error"
    } else {
        message
    };
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", message)
}
