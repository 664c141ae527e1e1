// Bootstrap utilities shared by the scheduler and worker binaries

use crate::config::Settings;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::queue::{NatsClient, NatsConfig};
use crate::source::{
    DocumentSourceFactory, HttpDocumentSourceFactory, RateLimitedSourceFactory, RedisRateLimiter,
};
use crate::store::PgWatchStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Connect to PostgreSQL and apply pending migrations
/// Used by: Worker, Scheduler
///
/// # Errors
/// Returns error if the pool cannot be created or migrations fail
#[tracing::instrument(skip(settings))]
pub async fn init_watch_store(settings: &Settings) -> Result<Arc<PgWatchStore>> {
    info!("Initializing watch store");

    let store = PgWatchStore::connect(&settings.database)
        .await
        .context("Failed to initialize database pool")?;

    store
        .migrate()
        .await
        .context("Failed to run database migrations")?;

    info!("Watch store initialized");
    Ok(Arc::new(store))
}

/// Connect to NATS and make sure the refresh stream exists
/// Used by: Worker, Scheduler
///
/// # Errors
/// Returns error if NATS is unreachable or the stream cannot be created
#[tracing::instrument(skip(settings))]
pub async fn init_nats_client(settings: &Settings) -> Result<NatsClient> {
    let nats_config = NatsConfig::from_settings(settings);
    info!(stream_name = %nats_config.stream_name, "Initializing NATS client");

    let nats_client = NatsClient::new(nats_config)
        .await
        .context("Failed to initialize NATS client")?;

    nats_client
        .initialize_stream()
        .await
        .context("Failed to initialize JetStream stream")?;

    info!("NATS client initialized");
    Ok(nats_client)
}

/// Build the document source factory, rate limited through Redis when enabled
/// Used by: Worker
///
/// # Errors
/// Returns error if the rate limiter is enabled and Redis is unreachable
#[tracing::instrument(skip(settings))]
pub async fn init_document_sources(settings: &Settings) -> Result<Arc<dyn DocumentSourceFactory>> {
    let adapter = &settings.adapter;
    let http: Arc<dyn DocumentSourceFactory> = Arc::new(HttpDocumentSourceFactory::new(
        adapter.base_url.clone(),
        Duration::from_secs(adapter.request_timeout_seconds),
    ));

    if adapter.rate_limit_max_requests == 0 {
        info!(base_url = %adapter.base_url, "Document source initialized without rate limit");
        return Ok(http);
    }

    let limiter = RedisRateLimiter::connect(
        &settings.redis,
        adapter.rate_limit_max_requests,
        Duration::from_secs(adapter.rate_limit_window_seconds),
    )
    .await
    .context("Failed to initialize Redis rate limiter")?;

    info!(
        base_url = %adapter.base_url,
        max_requests = adapter.rate_limit_max_requests,
        window_secs = adapter.rate_limit_window_seconds,
        "Document source initialized with rate limit"
    );
    Ok(Arc::new(RateLimitedSourceFactory::new(http, Arc::new(limiter))))
}

/// Pick the webhook notifier when a URL is configured, logging otherwise
/// Used by: Worker
///
/// # Errors
/// Returns error if the webhook HTTP client cannot be built
pub fn init_notifier(settings: &Settings) -> Result<Arc<dyn Notifier>> {
    match &settings.notifier.webhook_url {
        Some(url) => {
            let notifier = WebhookNotifier::new(
                url.clone(),
                Duration::from_secs(settings.notifier.timeout_seconds),
            )
            .context("Failed to initialize webhook notifier")?;
            info!(url = %url, "Webhook notifier initialized");
            Ok(Arc::new(notifier))
        }
        None => {
            info!("No webhook configured, change notifications are logged only");
            Ok(Arc::new(LogNotifier))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_defaults_to_log() {
        let settings = Settings::default();
        assert!(init_notifier(&settings).is_ok());
    }

    #[test]
    fn test_notifier_uses_webhook_when_configured() {
        let mut settings = Settings::default();
        settings.notifier.webhook_url = Some("http://localhost:9000/hooks".to_string());
        assert!(init_notifier(&settings).is_ok());
    }

    #[tokio::test]
    async fn test_document_sources_without_rate_limit_skip_redis() {
        let mut settings = Settings::default();
        settings.adapter.rate_limit_max_requests = 0;
        settings.redis.url = "redis://unreachable.invalid:6379".to_string();
        assert!(init_document_sources(&settings).await.is_ok());
    }
}
