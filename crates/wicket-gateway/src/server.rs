//! Server frontend.
//!
//! Builds the axum application: the observability endpoints, the proxy
//! fallback, and the global middleware stack. The stack runs outermost to
//! innermost as listed in [`build_router`]: security headers, CORS,
//! compression, correlation id, metrics + request log, body-size precheck,
//! rate limiting, and the per-request deadline. Metrics and logging sit
//! outside the limiter and the deadline: a 429 or a 504 is still a
//! completed response and must be counted and logged.

use crate::engine::Gateway;
use crate::plugins::auth;
use crate::{observability, proxy, responses};
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use http::{header, HeaderValue, Method};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::compression::predicate::SizeAbove;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{error, info, warn};
use wicket_core::rate_limit::{client_key, is_exempt_path};
use wicket_core::{correlation, Settings};

/// Responses below this size are not worth compressing.
const COMPRESSION_THRESHOLD: u16 = 1024;

/// Correlation id carried through the middleware chain as an extension.
#[derive(Clone)]
pub struct CorrelationId(pub String);

/// Assembles the full application.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/livez", get(observability::livez))
        .route("/readyz", get(observability::readyz))
        .route("/startupz", get(observability::startupz))
        .route("/health", get(observability::health))
        .route("/metrics", get(observability::metrics))
        .fallback(proxy_entry)
        .layer(
            ServiceBuilder::new()
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::X_FRAME_OPTIONS,
                    HeaderValue::from_static("SAMEORIGIN"),
                ))
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::STRICT_TRANSPORT_SECURITY,
                    HeaderValue::from_static("max-age=31536000"),
                ))
                .layer(cors_layer(&gateway.settings))
                .layer(from_fn(no_compression_guard))
                .layer(CompressionLayer::new().compress_when(SizeAbove::new(COMPRESSION_THRESHOLD)))
                .layer(from_fn(correlation_mw))
                .layer(from_fn_with_state(gateway.clone(), metrics_mw))
                .layer(from_fn(logger_mw))
                .layer(from_fn_with_state(gateway.clone(), body_limit_mw))
                .layer(from_fn_with_state(gateway.clone(), rate_limit_mw))
                .layer(from_fn_with_state(gateway.clone(), deadline_mw)),
        )
        .with_state(gateway)
}

/// Runs the server until `shutdown` resolves, then drains connections.
pub async fn serve(
    gateway: Arc<Gateway>,
    listener: tokio::net::TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(gateway);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let wildcard = settings.cors_origins.iter().any(|o| o == "*");
    let mut layer = CorsLayer::new().allow_methods([
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::PATCH,
        Method::OPTIONS,
    ]);
    if wildcard {
        layer = layer.allow_origin(Any).allow_headers(Any);
    } else {
        let origins: Vec<HeaderValue> = settings
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer = layer
            .allow_origin(AllowOrigin::list(origins))
            .allow_headers(AllowHeaders::mirror_request());
        // Credentials are incompatible with a wildcard origin, so the flag
        // only takes effect with an explicit origin list.
        if settings.cors_credentials {
            layer = layer.allow_credentials(true);
        }
    }
    layer
}

/// `x-no-compression` opts a request out by stripping what the client said
/// it accepts, before the compression layer looks at it.
async fn no_compression_guard(mut req: Request, next: Next) -> Response {
    if req.headers().contains_key("x-no-compression") {
        req.headers_mut().remove(header::ACCEPT_ENCODING);
    }
    next.run(req).await
}

async fn correlation_mw(mut req: Request, next: Next) -> Response {
    let id = correlation::extract_or_generate(req.headers());
    req.extensions_mut().insert(CorrelationId(id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .insert(correlation::RESPONSE_HEADER, value);
    }
    response
}

async fn metrics_mw(State(gateway): State<Arc<Gateway>>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    let label = route_label(&gateway, &path);
    gateway.metrics.record_http(
        &method,
        &label,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Bounded-cardinality route label: the observability path itself, the
/// matched prefix, or `unmatched`.
fn route_label(gateway: &Gateway, path: &str) -> String {
    if is_exempt_path(path) {
        return path.to_string();
    }
    gateway
        .supervisor
        .current()
        .and_then(|table| table.match_route(path))
        .map(|entry| entry.route.path_prefix.clone())
        .unwrap_or_else(|| "unmatched".to_string())
}

async fn logger_mw(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0.clone())
        .unwrap_or_default();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    if status >= 500 {
        error!(%method, %path, status, latency_ms, %correlation_id, "request failed");
    } else if status >= 400 {
        warn!(%method, %path, status, latency_ms, %correlation_id, "request rejected");
    } else {
        info!(%method, %path, status, latency_ms, %correlation_id, "request completed");
    }
    response
}

/// Cheap early rejection on the declared body size; the authoritative check
/// happens when the proxy buffers the body.
async fn body_limit_mw(State(gateway): State<Arc<Gateway>>, req: Request, next: Next) -> Response {
    let limit = gateway.settings.request_body_limit;
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if matches!(declared, Some(len) if len > limit) {
        return responses::payload_too_large(limit);
    }
    next.run(req).await
}

async fn rate_limit_mw(State(gateway): State<Arc<Gateway>>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if is_exempt_path(path) {
        return next.run(req).await;
    }
    let Some(peer) = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0)
    else {
        return next.run(req).await;
    };

    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let key = client_key(forwarded, &peer, gateway.settings.trust_proxy);

    // Auth-protected routes get the strict profile.
    let strict = gateway
        .supervisor
        .current()
        .and_then(|table| table.match_route(path))
        .map(|entry| entry.plugins.iter().any(|p| p.name() == auth::PLUGIN_NAME))
        .unwrap_or(false);

    let decision = if strict {
        gateway
            .strict_limiter
            .check(&format!("strict:{key}"))
            .await
    } else {
        gateway.limiter.check(&key).await
    };

    if decision.is_allowed() {
        next.run(req).await
    } else {
        responses::rate_limited(gateway.limiter.window().as_secs())
    }
}

async fn deadline_mw(State(gateway): State<Arc<Gateway>>, req: Request, next: Next) -> Response {
    match tokio::time::timeout(gateway.settings.request_timeout, next.run(req)).await {
        Ok(response) => response,
        Err(_) => responses::gateway_timeout(),
    }
}

/// Fallback handler: everything that is not an observability endpoint goes
/// through the published routing table.
async fn proxy_entry(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    let Some(table) = gateway.supervisor.current() else {
        return responses::not_configured();
    };
    let path = req.uri().path().to_string();
    let Some(entry) = table.match_route(&path) else {
        return responses::not_found(&path);
    };

    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0.clone())
        .unwrap_or_else(|| correlation::extract_or_generate(req.headers()));
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let (parts, body) = req.into_parts();
    let limit = gateway.settings.request_body_limit;
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => return responses::payload_too_large(limit),
    };

    proxy::handle(gateway, entry, parts, bytes, peer, correlation_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_accepts_wildcard() {
        let settings = Settings::default();
        assert_eq!(settings.cors_origins, vec!["*"]);
        let _ = cors_layer(&settings);
    }

    #[test]
    fn test_cors_layer_with_explicit_origins_and_credentials() {
        let settings = Settings {
            cors_origins: vec!["https://app.example".to_string()],
            cors_credentials: true,
            ..Settings::default()
        };
        let _ = cors_layer(&settings);
    }

    #[test]
    fn test_cors_wildcard_suppresses_credentials() {
        // Must not panic: credentials are ignored with a wildcard origin.
        let settings = Settings {
            cors_credentials: true,
            ..Settings::default()
        };
        let _ = cors_layer(&settings);
    }
}
