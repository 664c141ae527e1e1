// Scheduler binary entry point

use anyhow::{Context, Result};
use common::bootstrap::{init_nats_client, init_watch_store};
use common::config::Settings;
use common::queue::{JobPublisher, NatsJobPublisher};
use common::scheduler::{Scheduler, SchedulerConfig, SchedulerEngine};
use common::store::WatchStore;
use common::telemetry::{init_logging, init_metrics, shutdown_tracer};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    init_metrics(settings.observability.metrics_port)?;

    info!(
        nats_url = %settings.nats.url,
        lease_ttl_secs = settings.lease_ttl().as_secs(),
        "Starting case-watch scheduler"
    );

    let store = init_watch_store(&settings).await?;
    let nats_client = init_nats_client(&settings).await?;
    let publisher = Arc::new(NatsJobPublisher::new(nats_client)) as Arc<dyn JobPublisher>;

    let scheduler = Arc::new(SchedulerEngine::new(
        SchedulerConfig::from_settings(&settings),
        store.clone() as Arc<dyn WatchStore>,
        publisher,
    ));

    let scheduler_for_shutdown = Arc::clone(&scheduler);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal, initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        if let Err(e) = scheduler_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    if let Err(e) = scheduler.start().await {
        error!(error = %e, "Scheduler error");
    }

    store.close().await;
    shutdown_tracer();
    info!("Scheduler stopped");
    Ok(())
}
