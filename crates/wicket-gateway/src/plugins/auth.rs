//! Central authentication plugin.
//!
//! Delegates the auth decision to an external verification service. On a
//! positive verdict the request continues toward the upstream carrying
//! `X-User-Id` instead of the original `Authorization` header; every other
//! verdict is returned to the client with the service's body untouched so
//! localized error messages survive the hop.

use super::{Plugin, PluginOutcome, RequestContext};
use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use http::{header, HeaderValue, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use wicket_core::error::{GatewayError, Result};

pub const PLUGIN_NAME: &str = "central-auth";

const VERIFY_PATH: &str = "/api/v1/authz/verify";
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client metadata headers copied through to the verification call.
const FORWARDED_HEADERS: [&str; 9] = [
    "accept-language",
    "device-type",
    "app-version",
    "device-id",
    "x-device-os",
    "gps-coordinates",
    "x-forwarded-for",
    "x-real-ip",
    "user-agent",
];

/// Builds a [`CentralAuthPlugin`] from route params.
///
/// Requires a non-empty `auth_service_url` (http/https); trailing slashes
/// are trimmed so the verify path concatenates cleanly.
pub fn factory(params: &serde_json::Value) -> Result<Arc<dyn Plugin>> {
    let url = params
        .get("auth_service_url")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::PluginLoad {
            name: PLUGIN_NAME.to_string(),
            reason: "auth_service_url is required".to_string(),
        })?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(GatewayError::PluginLoad {
            name: PLUGIN_NAME.to_string(),
            reason: format!("auth_service_url must be http or https, got {url:?}"),
        });
    }

    // Dedicated client: auth traffic gets its own connection pool, separate
    // from the proxy's upstream pool.
    let client = reqwest::Client::builder()
        .timeout(VERIFY_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::PluginLoad {
            name: PLUGIN_NAME.to_string(),
            reason: format!("http client: {e}"),
        })?;

    Ok(Arc::new(CentralAuthPlugin {
        verify_url: format!("{url}{VERIFY_PATH}"),
        client,
    }))
}

pub struct CentralAuthPlugin {
    verify_url: String,
    client: reqwest::Client,
}

fn fail_body(error: &str, message: &str) -> serde_json::Value {
    json!({
        "status": "fail",
        "error": error,
        "errorDetails": [{"message": message}],
    })
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_default()
}

/// Returns the auth service's body as-is, clamping the status into the
/// client-error range (anything outside [400, 500) becomes 401).
fn verbatim_response(status: StatusCode, content_type: Option<HeaderValue>, body: bytes::Bytes) -> Response {
    let status = if status.as_u16() >= 400 && status.as_u16() < 500 {
        status
    } else {
        StatusCode::UNAUTHORIZED
    };
    let mut builder = Response::builder().status(status);
    builder = builder.header(
        header::CONTENT_TYPE,
        content_type.unwrap_or_else(|| HeaderValue::from_static("application/json")),
    );
    builder.body(Body::from(body)).unwrap_or_default()
}

#[async_trait]
impl Plugin for CentralAuthPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn apply(&self, ctx: &mut RequestContext) -> Result<PluginOutcome> {
        let Some(authorization) = ctx.headers.get(header::AUTHORIZATION).cloned() else {
            return Ok(PluginOutcome::Respond(json_response(
                StatusCode::UNAUTHORIZED,
                fail_body("UNAUTHORIZED", "Authorization header is required"),
            )));
        };

        let mut request = self
            .client
            .post(&self.verify_url)
            .header(header::AUTHORIZATION, authorization)
            .header("x-original-uri", ctx.uri.clone())
            .header("x-original-method", ctx.method.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .body("{}");
        for name in FORWARDED_HEADERS {
            if let Some(value) = ctx.headers.get(name) {
                request = request.header(name, value.clone());
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    error = %err,
                    "auth service unreachable"
                );
                return Ok(PluginOutcome::Respond(json_response(
                    StatusCode::BAD_GATEWAY,
                    fail_body("AUTH_SERVICE_UNAVAILABLE", &err.to_string()),
                )));
            }
        };

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);

        // 5xx from the auth service is an availability problem, not a verdict.
        if status.is_server_error() {
            warn!(
                correlation_id = %ctx.correlation_id,
                %status,
                "auth service returned a server error"
            );
            return Ok(PluginOutcome::Respond(json_response(
                StatusCode::BAD_GATEWAY,
                fail_body(
                    "AUTH_SERVICE_UNAVAILABLE",
                    &format!("auth service responded with {status}"),
                ),
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok());
        let body = response.bytes().await.map_err(GatewayError::from_reqwest)?;

        if status.is_success() {
            let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let verified = parsed["data"]["verifyStatus"] == json!(true);
            if verified {
                // Accept both numeric and string user ids.
                let user_id = match &parsed["data"]["userId"] {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    other => other.to_string(),
                };
                if let Ok(value) = HeaderValue::from_str(&user_id) {
                    ctx.headers.insert("x-user-id", value);
                }
                ctx.headers.remove(header::AUTHORIZATION);
                return Ok(PluginOutcome::Continue);
            }
            // 2xx but not verified: deny, forwarding whatever the service said.
            return Ok(PluginOutcome::Respond(verbatim_response(
                status,
                content_type,
                body,
            )));
        }

        // 4xx (and anything else non-2xx/non-5xx): the service's decision,
        // passed through verbatim.
        Ok(PluginOutcome::Respond(verbatim_response(
            status,
            content_type,
            body,
        )))
    }
}
