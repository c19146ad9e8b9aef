//! Minimal `/healthz` endpoint (ambient component A6). Each binary spawns
//! one so a process supervisor has something to poll; it reports healthy
//! until the shutdown signal fires, then the task is aborted by the
//! caller as part of graceful shutdown.

use axum::{routing::get, Router};
use tokio::sync::watch;

async fn healthz() -> &'static str {
    "ok"
}

/// Spawns the health server on `HEALTH_PORT` (default 8080) and returns
/// its `JoinHandle` so the caller can abort it during shutdown.
pub fn spawn_health_server(_shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    let port: u16 = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    tokio::spawn(async move {
        let app = Router::new().route("/healthz", get(healthz));
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(error = %err, port, "failed to bind health server, skipping");
                return;
            }
        };
        if let Err(err) = axum::serve(listener, app).await {
            tracing::warn!(error = %err, "health server exited");
        }
    })
}
