// Change notifications sent to a watch's owner

use crate::errors::NotifyError;
use crate::models::{ExecutionResult, Watch};
use async_trait::async_trait;
use chrono_tz::Tz;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Payload describing a detected change on a watch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub watch_id: Uuid,
    pub owner_id: Uuid,
    pub alias: Option<String>,
    pub result: ExecutionResult,
    /// Execution time rendered in the deployment's timezone
    pub executed_at_local: String,
}

impl ChangeEvent {
    pub fn new(watch: &Watch, result: &ExecutionResult, tz: Tz) -> Self {
        Self {
            watch_id: watch.id,
            owner_id: watch.owner_id,
            alias: watch.alias.clone(),
            result: result.clone(),
            executed_at_local: result
                .executed_at
                .with_timezone(&tz)
                .format("%Y-%m-%d %H:%M:%S %:z")
                .to_string(),
        }
    }
}

/// Notifier delivers change events; delivery failures never affect the refresh
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError>;
}

/// Writes change events to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError> {
        info!(
            watch_id = %event.watch_id,
            owner_id = %event.owner_id,
            alias = event.alias.as_deref(),
            executed_at = %event.executed_at_local,
            "Watch has new case data"
        );
        Ok(())
    }
}

/// POSTs change events as JSON to a fixed URL
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Delivery(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, event), fields(watch_id = %event.watch_id))]
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Delivery(format!(
                "Webhook responded with HTTP {}",
                status.as_u16()
            )));
        }

        Ok(())
    }
}
