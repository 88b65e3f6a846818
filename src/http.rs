//! # Health & Metrics Endpoints
//!
//! Optional listener started by `fleetfeed worker --metrics-port`.
//!
//! | Endpoint | Purpose | K8s Probe |
//! |----------|---------|-----------|
//! | `GET /healthz` | Liveness: process is alive | `livenessProbe` |
//! | `GET /readyz` | Readiness: KV and relational store reachable | `readinessProbe` |
//! | `GET /metrics` | Prometheus scraping endpoint | `ServiceMonitor` |
//!
//! The readiness probe pings both stores under a 2-second timeout and
//! answers 503 naming the first one that fails.

use crate::jobs::Deps;
use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

const READY_TIMEOUT: Duration = Duration::from_secs(2);

pub fn router(deps: Deps) -> Router {
    Router::new()
        .route("/healthz", get(handler_healthz))
        .route("/readyz", get(handler_readyz))
        .route("/metrics", get(handler_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(deps)
}

/// Serve on `0.0.0.0:port` until `shutdown` turns true.
pub async fn serve(port: u16, deps: Deps, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics listener started");
    axum::serve(listener, router(deps))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

pub async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn handler_readyz(State(deps): State<Deps>) -> impl IntoResponse {
    match tokio::time::timeout(READY_TIMEOUT, deps.kv.ping()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return (StatusCode::SERVICE_UNAVAILABLE, "kv store unreachable"),
        Err(_) => return (StatusCode::SERVICE_UNAVAILABLE, "kv store timeout"),
    }
    match tokio::time::timeout(READY_TIMEOUT, deps.store.ping()).await {
        Ok(Ok(())) => (StatusCode::OK, "ok"),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database timeout"),
    }
}

pub async fn handler_metrics(State(deps): State<Deps>) -> impl IntoResponse {
    let body = deps.metrics.encode();
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
}
