// NATS JetStream client for the refresh queue

use crate::config::Settings;
use crate::errors::QueueError;
use async_nats::jetstream::{
    consumer::{pull::Config as PullConfig, AckPolicy, DeliverPolicy, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, Stream},
    Context as JetStreamContext,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    /// Subject prefix; jobs are published to `{subject}.{kind}`
    pub subject: String,
    pub max_age_seconds: u64,
    pub consumer_name: String,
    /// Deliveries before the broker gives up on a message
    pub max_deliver: i64,
    /// Time the broker waits for an ack before redelivering
    pub ack_wait: Duration,
    /// Unacked messages allowed in flight on the durable consumer, shared by
    /// every worker process; 0 leaves the broker default
    pub max_ack_pending: i64,
    pub publish_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl NatsConfig {
    /// Derive broker limits from the worker lifecycle settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            url: settings.nats.url.clone(),
            stream_name: settings.nats.stream_name.clone(),
            subject: settings.nats.subject.clone(),
            max_age_seconds: settings.nats.max_age_seconds,
            consumer_name: settings.nats.consumer_name.clone(),
            // One extra delivery lets the supervisor record the terminal failure
            // of a job whose attempts were all lost to crashed workers
            max_deliver: i64::from(settings.worker.max_retries) + 1,
            ack_wait: Duration::from_secs(
                settings.worker.hard_limit_seconds + settings.scheduler.lease_margin_seconds,
            ),
            max_ack_pending: settings.nats.max_ack_pending,
            publish_timeout: Duration::from_secs(settings.nats.publish_timeout_seconds),
        }
    }

    fn wildcard_subject(&self) -> String {
        format!("{}.>", self.subject)
    }
}

/// NATS JetStream client
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to the NATS server
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn new(config: NatsConfig) -> Result<Self, QueueError> {
        info!("Connecting to NATS server");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS server successfully");

        let jetstream = async_nats::jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            config,
        })
    }

    /// Create the work-queue stream if missing
    #[instrument(skip(self))]
    pub async fn initialize_stream(&self) -> Result<Stream, QueueError> {
        info!(stream_name = %self.config.stream_name, "Initializing JetStream stream");

        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![self.config.wildcard_subject()],
            // Messages are deleted once acknowledged
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(self.config.max_age_seconds),
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::StreamCreation(format!("Failed to create stream: {}", e)))?;

        info!(stream_name = %self.config.stream_name, "Stream initialized successfully");

        Ok(stream)
    }

    /// Create or get the durable pull consumer shared by all worker slots
    #[instrument(skip(self))]
    pub async fn get_or_create_consumer(&self) -> Result<PullConsumer, QueueError> {
        info!(consumer_name = %self.config.consumer_name, "Creating consumer");

        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| QueueError::StreamNotFound(format!("Stream not found: {}", e)))?;

        let consumer_config = PullConfig {
            durable_name: Some(self.config.consumer_name.clone()),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.config.ack_wait,
            max_deliver: self.config.max_deliver,
            max_ack_pending: self.config.max_ack_pending,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&self.config.consumer_name, consumer_config)
            .await
            .map_err(|e| {
                QueueError::ConsumerCreation(format!("Failed to create consumer: {}", e))
            })?;

        info!(
            consumer_name = %self.config.consumer_name,
            ack_wait_secs = self.config.ack_wait.as_secs(),
            max_deliver = self.config.max_deliver,
            "Consumer created successfully"
        );

        Ok(consumer)
    }

    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Verify the stream is reachable
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| QueueError::Connection(format!("Health check failed: {}", e)))?;

        Ok(())
    }
}
