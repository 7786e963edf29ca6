mod builder;
mod config;
mod engine;
mod error;
mod evaluator;
mod executor;
mod health;
mod limits;
mod orchestrator;
mod reaper;
mod retry;
mod staging;

#[cfg(test)]
mod testing;

use builder::{BuildManager, BuildSettings};
use config::WorkerConfig;
use engine::DockerEngine;
use executor::{ExecutionManager, ExecutionSettings};
use orchestrator::{LeaseSettings, Orchestrator};
use reaper::Reaper;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use yantra_common::redis::{self, RedisLeases, RedisQueue, RedisStore};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Yantra Worker booting...");

    let config = WorkerConfig::load_default().map_err(|e| {
        error!("Failed to load worker configuration: {:#}", e);
        e
    })?;
    info!(
        pool_size = config.pool_size,
        staging_root = %config.staging_root,
        runtime = ?config.container_runtime,
        "Configuration loaded"
    );

    let shared = yantra_common::config::Config::from_env();
    let conn = redis::connect(&shared.redis_url).await?;
    info!("Connected to Redis: {}", shared.redis_url);

    let engine = Arc::new(DockerEngine::connect()?);
    engine.ping().await.map_err(|e| {
        error!("Docker daemon is not reachable: {}", e);
        e
    })?;
    info!("Connected to Docker daemon");

    let store = Arc::new(RedisStore::new(conn.clone()));
    let queue = Arc::new(RedisQueue::new(conn.clone()));
    let leases = Arc::new(RedisLeases::new(conn));

    let builds = BuildManager::new(store.clone(), engine.clone(), BuildSettings::from(&config));
    let executions =
        ExecutionManager::new(store.clone(), engine, ExecutionSettings::from(&config));
    let orchestrator = Arc::new(Orchestrator::new(
        queue.clone(),
        leases.clone(),
        builds,
        executions,
        LeaseSettings::from(&config),
        config.pool_size,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = Reaper::from_config(&config, store, queue, leases);
    let reaper_task = tokio::spawn(reaper.run(shutdown_rx.clone()));

    let health_addr = config.health_addr.clone();
    let health_orchestrator = orchestrator.clone();
    let health_rx = shutdown_rx.clone();
    let health_task = tokio::spawn(async move {
        if let Err(e) = health::serve(&health_addr, health_orchestrator, health_rx).await {
            error!("{:#}", e);
        }
    });

    let worker = tokio::spawn(orchestrator.run(shutdown_rx, config.poll_timeout()));

    // Setup graceful shutdown
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    warn!("Received shutdown signal, draining in-flight jobs...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = worker.await {
        error!(error = %e, "Worker loop panicked");
    }
    let _ = reaper_task.await;
    let _ = health_task.await;

    info!("Worker shutdown complete");
    Ok(())
}
