// Worker binary entry point

use anyhow::{Context, Result};
use common::bootstrap::{init_document_sources, init_nats_client, init_notifier, init_watch_store};
use common::config::Settings;
use common::queue::{JobSource, NatsJobSource};
use common::retry::LifecyclePolicy;
use common::store::WatchStore;
use common::telemetry::{init_logging, init_metrics, shutdown_tracer};
use common::worker::{RefreshExecutor, Supervisor, WorkerPool, WorkerPoolConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    let timezone = settings
        .notifier
        .tz()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    init_metrics(settings.observability.metrics_port)?;

    info!(
        pool_size = settings.worker.pool_size,
        soft_limit_secs = settings.worker.soft_limit_seconds,
        hard_limit_secs = settings.worker.hard_limit_seconds,
        max_retries = settings.worker.max_retries,
        "Starting case-watch worker"
    );

    let store = init_watch_store(&settings).await?;
    let nats_client = init_nats_client(&settings).await?;
    let jobs = NatsJobSource::new(&nats_client)
        .await
        .context("Failed to create NATS consumer")?;
    let sources = init_document_sources(&settings).await?;
    let notifier = init_notifier(&settings)?;

    let watch_store = store.clone() as Arc<dyn WatchStore>;
    let executor = Arc::new(RefreshExecutor::new(
        Arc::clone(&watch_store),
        notifier,
        timezone,
    ));
    let supervisor = Arc::new(Supervisor::new(
        executor,
        watch_store,
        LifecyclePolicy::from_settings(&settings.worker),
        settings.lease_ttl(),
    ));

    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig::from_settings(&settings.worker),
        Arc::new(jobs) as Arc<dyn JobSource>,
        sources,
        supervisor,
    ));

    let pool_for_run = Arc::clone(&pool);
    let pool_handle = tokio::spawn(async move { pool_for_run.run().await });

    info!("Worker is running. Press Ctrl+C to shutdown gracefully");
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    info!("Waiting for in-flight refreshes to complete");
    pool.shutdown();
    if let Err(e) = pool_handle.await {
        error!(error = %e, "Worker pool task failed");
    }

    store.close().await;
    shutdown_tracer();
    info!("Worker shutdown complete");
    Ok(())
}
