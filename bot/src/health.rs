//! Health check HTTP server for container probes.
//!
//! Exposes liveness and readiness endpoints plus the Prometheus scrape
//! endpoint.

use axum::{routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::metrics::encode_metrics;

/// Shared health state between the event loops and the health server.
#[derive(Debug, Clone)]
pub struct HealthState {
    /// Set once the account is authenticated and the event stream is open.
    ready: Arc<AtomicBool>,
    /// Cleared when a fatal error makes a restart necessary.
    healthy: Arc<AtomicBool>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        info!("bot marked as ready");
    }

    /// Mark the bot as unhealthy, which triggers a restart under an
    /// orchestrator.
    pub fn set_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        error!("bot marked as unhealthy");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the health check HTTP server on the given address.
pub async fn start_health_server(
    host: &str,
    port: u16,
    state: HealthState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = Router::new()
        .route(
            "/health",
            get({
                let state = state.clone();
                move || health_handler(state.clone())
            }),
        )
        .route(
            "/ready",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
        .route("/metrics", get(metrics_handler));

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("health server listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(state: HealthState) -> axum::http::StatusCode {
    if state.is_healthy() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn ready_handler(state: HealthState) -> axum::http::StatusCode {
    if state.is_ready() && state.is_healthy() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler() -> String {
    encode_metrics()
}
