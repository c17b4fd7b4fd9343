//! # Wicket gateway entry point
//!
//! Starts the gateway: loads env settings, performs the initial route-table
//! build, spawns the config watcher, and serves until SIGTERM/SIGINT. A
//! failed initial load is fatal (exit 1); later reload failures keep the
//! previous table.
//!
//! ## Usage
//!
//! ```bash
//! # Serve with the config path from GATEWAY_CONFIG_PATH (default gateway.yaml)
//! wicket
//!
//! # Explicit config file and port
//! wicket --config /etc/wicket/gateway.yaml --port 8080
//! ```

use anyhow::{Context, Result};
use argh::FromArgs;
use std::net::SocketAddr;
use tracing::{error, info, warn};
use wicket_core::Settings;
use wicket_gateway::{ConfigWatcher, Gateway};

/// wicket - dynamically configurable HTTP API gateway
#[derive(FromArgs)]
struct Args {
    /// path to the route-table config file
    ///
    /// Overrides GATEWAY_CONFIG_PATH. The file is watched for changes and
    /// the table is rebuilt atomically on every settled write.
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// port to listen on
    ///
    /// Overrides PORT. Defaults to 3000.
    #[argh(option, short = 'p')]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let mut settings = Settings::from_env();
    if let Some(config) = args.config {
        settings.config_path = config;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }

    // RUST_LOG wins; LOG_LEVEL is the documented knob.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(
        mode = settings.mode.as_str(),
        config = %settings.config_path,
        port = settings.port,
        "starting wicket gateway"
    );

    let port = settings.port;
    let gateway = Gateway::new(settings)
        .await
        .context("engine construction failed")?;

    // The first build must succeed; a gateway that can never route is a
    // deployment error, not a degraded state.
    if let Err(err) = gateway.supervisor.rebuild().await {
        error!(error = %err, "initial configuration load failed");
        anyhow::bail!("initial configuration load failed: {err}");
    }

    let watcher = ConfigWatcher::new(gateway.settings.config_path.clone().into());
    let watcher_handle = watcher.spawn(gateway.supervisor.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let graceful = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    let server = tokio::spawn(wicket_gateway::serve(gateway.clone(), listener, graceful));

    // Wait for the signal, then give in-flight requests the grace window.
    let _ = shutdown_rx.changed().await;
    watcher_handle.abort();

    let grace = gateway.settings.shutdown_timeout;
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => {
            joined
                .context("server task panicked")?
                .context("server error")?;
        }
        Err(_) => {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "grace window elapsed, closing remaining connections"
            );
        }
    }

    gateway.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
