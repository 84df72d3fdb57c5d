//! modelgate: model-aware reverse proxy for AI inference backends.
//!
//! Main entry point. Responsibilities:
//! 1. Parse CLI arguments and do one synchronous store load before
//!    accepting traffic.
//! 2. Spawn the background tasks: snapshot refresher, access-log writer,
//!    and the optional Prometheus listener.
//! 3. Serve the proxy; every method and path falls through to the
//!    dispatcher.
//! 4. Drain in-flight requests on `Ctrl+C` or `SIGTERM`, join the
//!    background tasks, exit 0.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use modelgate::access_log::AccessLog;
use modelgate::config::{ConfigError, StorePaths, DEFAULT_PORT};
use modelgate::config_reloader;
use modelgate::dispatcher::{dispatch, ProxyServer};
use modelgate::metrics::metrics_handler;
use modelgate::shutdown::ShutdownCoordinator;

/// Command-line interface for the proxy.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML backend table.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Path to the `user:key` authorized users file.
    #[arg(long, default_value = "authorized_users.txt")]
    users_list: String,

    /// Path to the CSV access log.
    #[arg(long, default_value = "access_log.txt")]
    log_path: String,

    /// Port the proxy listens on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Optional bind address for the Prometheus /metrics listener.
    /// The proxy port forwards every path, so metrics need their own.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Disable bearer-token authentication.
    #[arg(short = 'd', long)]
    deactivate_security: bool,
}

#[tokio::main]
async fn main() -> Result<(), ConfigError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    let (access_log, log_writer) = AccessLog::new(&args.log_path);
    let proxy = Arc::new(ProxyServer::new(
        StorePaths {
            config: args.config,
            users: args.users_list,
        },
        args.deactivate_security,
        access_log,
    ));

    // Boot load is fatal: a proxy that cannot read its store at startup
    // has nothing to serve. Refresh-time failures only log.
    let summary = config_reloader::reload(&proxy)?;
    info!(
        backends = summary.backends,
        users = summary.users,
        security_disabled = args.deactivate_security,
        "Loaded initial configuration"
    );

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.spawn(log_writer.run(coordinator.subscribe()));
    coordinator.spawn(config_reloader::refresh_loop(
        proxy.clone(),
        coordinator.subscribe(),
    ));
    if let Some(metrics_addr) = args.metrics_addr {
        coordinator.spawn(serve_metrics(metrics_addr, coordinator.subscribe()));
    }

    let app = Router::new().fallback(dispatch).with_state(proxy);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!(%addr, "Starting modelgate");

    let server = axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        error!(error = %e, "Proxy server error");
    }

    if let Err(e) = coordinator.shutdown(Duration::from_secs(30)).await {
        error!(error = %e, "Background task shutdown incomplete");
    }
    info!("Shutdown complete.");
    Ok(())
}

/// Serves the Prometheus text exposition on its own listener.
async fn serve_metrics(addr: SocketAddr, mut shutdown_rx: watch::Receiver<()>) {
    let app = Router::new().route("/metrics", get(metrics_handler));
    info!(%addr, "Serving Prometheus metrics");

    let server = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Resolves when the process should stop accepting connections.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, draining in-flight requests."),
        _ = terminate => info!("SIGTERM received, draining in-flight requests."),
    }
}
