// Liveness and pool status over HTTP
use crate::orchestrator::{Orchestrator, PoolStatus};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(orchestrator)
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn status(State(orchestrator): State<Arc<Orchestrator>>) -> Json<PoolStatus> {
    Json(orchestrator.status())
}

pub async fn serve(
    addr: &str,
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", addr))?;
    info!("Health endpoint listening on {}", addr);

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Health endpoint failed")
}
