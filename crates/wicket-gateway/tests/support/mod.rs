//! Shared fixtures: in-process upstreams and a fully wired gateway bound to
//! an ephemeral port.

#![allow(dead_code)]

use axum::extract::{Request, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use wicket_core::Settings;
use wicket_gateway::Gateway;

pub struct TestUpstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    _server: JoinHandle<()>,
}

impl TestUpstream {
    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn spawn_router(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, server)
}

fn header<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn echo_handler(State(hits): State<Arc<AtomicUsize>>, req: Request) -> impl IntoResponse {
    hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "path": req.uri().path_and_query().map(|p| p.to_string()).unwrap_or_default(),
        "method": req.method().to_string(),
        "host": header(&req, "host"),
        "authorization": header(&req, "authorization"),
        "x-user-id": header(&req, "x-user-id"),
        "x-request-id": header(&req, "x-request-id"),
        "x-forwarded-for": header(&req, "x-forwarded-for"),
        "connection": header(&req, "connection"),
    }))
}

/// Upstream that answers 200 with a JSON echo of the request it saw.
pub async fn echo_upstream() -> TestUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback(echo_handler)
        .with_state(hits.clone());
    let (addr, server) = spawn_router(app).await;
    TestUpstream {
        addr,
        hits,
        _server: server,
    }
}

/// Upstream that answers every non-probe request with a fixed status.
pub async fn fixed_status_upstream(status: u16) -> TestUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback(
            move |State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    http::StatusCode::from_u16(status).unwrap(),
                    Json(json!({"upstream": "fixed", "status": status})),
                )
            },
        )
        .with_state(hits.clone());
    let (addr, server) = spawn_router(app).await;
    TestUpstream {
        addr,
        hits,
        _server: server,
    }
}

/// Upstream that sleeps before answering, tagged so tests can tell which
/// table generation served a request.
pub async fn slow_upstream(delay: Duration, tag: &'static str) -> TestUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback(
            move |State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Json(json!({"tag": tag}))
            },
        )
        .with_state(hits.clone());
    let (addr, server) = spawn_router(app).await;
    TestUpstream {
        addr,
        hits,
        _server: server,
    }
}

/// An origin where nothing listens: connections are refused immediately.
pub async fn refused_origin() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub struct TestGateway {
    pub base_url: String,
    pub gateway: Arc<Gateway>,
    pub config_path: PathBuf,
    _dir: tempfile::TempDir,
    _server: JoinHandle<std::io::Result<()>>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn launch(
    config: Option<&str>,
    tweak: impl FnOnce(&mut Settings),
    rebuild: bool,
) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("gateway.yaml");
    if let Some(config) = config {
        std::fs::write(&config_path, config).unwrap();
    }

    let mut settings = Settings {
        config_path: config_path.display().to_string(),
        ..Settings::default()
    };
    tweak(&mut settings);

    let gateway = Gateway::new(settings).await.unwrap();
    if rebuild {
        gateway.supervisor.rebuild().await.unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(wicket_gateway::serve(
        gateway.clone(),
        listener,
        std::future::pending(),
    ));

    TestGateway {
        base_url: format!("http://{addr}"),
        gateway,
        config_path,
        _dir: dir,
        _server: server,
    }
}

/// Gateway with the given route config published.
pub async fn start_gateway(config: &str, tweak: impl FnOnce(&mut Settings)) -> TestGateway {
    launch(Some(config), tweak, true).await
}

/// Gateway that has never published a table.
pub async fn start_unconfigured_gateway(tweak: impl FnOnce(&mut Settings)) -> TestGateway {
    launch(None, tweak, false).await
}
