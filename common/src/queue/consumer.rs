// Job consumer side of the dispatch queue

use crate::errors::QueueError;
use crate::queue::message::JobMessage;
use crate::queue::nats::NatsClient;
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::{AckKind, Message};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// A job handed to exactly one worker slot until it is settled
///
/// Dropping a delivery without settling it leaves the message unacked; the
/// broker redelivers it once its ack deadline passes.
#[async_trait]
pub trait Delivery: Send {
    fn message(&self) -> &JobMessage;

    /// 1-based count of deliveries of this message, including this one
    fn delivery_count(&self) -> u32;

    /// Remove the message from the queue
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    /// Redeliver the message after `delay`
    async fn retry(self: Box<Self>, delay: Duration) -> Result<(), QueueError>;

    /// Drop the message without redelivery
    async fn reject(self: Box<Self>) -> Result<(), QueueError>;
}

/// Pull-based source of jobs; each call yields at most one job
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Wait up to `wait` for the next job
    async fn next(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>, QueueError>;
}

/// JetStream pull consumer fetching one message per call
#[derive(Clone)]
pub struct NatsJobSource {
    consumer: PullConsumer,
}

impl NatsJobSource {
    #[instrument(skip(client))]
    pub async fn new(client: &NatsClient) -> Result<Self, QueueError> {
        let consumer = client.get_or_create_consumer().await?;
        Ok(Self { consumer })
    }

    pub fn from_consumer(consumer: PullConsumer) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl JobSource for NatsJobSource {
    async fn next(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>, QueueError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| QueueError::ConsumeFailed(format!("Failed to fetch messages: {}", e)))?;

        while let Some(item) = batch.next().await {
            let message = item
                .map_err(|e| QueueError::ConsumeFailed(format!("Error receiving message: {}", e)))?;

            match JobMessage::decode(&message.payload) {
                Ok(job) => {
                    let delivered = message
                        .info()
                        .map(|info| u32::try_from(info.delivered).unwrap_or(u32::MAX))
                        .unwrap_or(1);
                    debug!(watch_id = %job.watch_id(), delivered, "Fetched job");
                    return Ok(Some(Box::new(NatsDelivery {
                        message,
                        job,
                        delivered,
                    })));
                }
                Err(e) => {
                    warn!(
                        subject = %message.subject,
                        error = %e,
                        "Rejecting undecodable job payload"
                    );
                    message
                        .ack_with(AckKind::Term)
                        .await
                        .map_err(|e| QueueError::AckFailed(format!("Failed to terminate message: {}", e)))?;
                }
            }
        }

        Ok(None)
    }
}

struct NatsDelivery {
    message: Message,
    job: JobMessage,
    delivered: u32,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn message(&self) -> &JobMessage {
        &self.job
    }

    fn delivery_count(&self) -> u32 {
        self.delivered
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.message
            .ack()
            .await
            .map_err(|e| QueueError::AckFailed(format!("Failed to acknowledge message: {}", e)))
    }

    async fn retry(self: Box<Self>, delay: Duration) -> Result<(), QueueError> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| {
                QueueError::AckFailed(format!("Failed to negative acknowledge message: {}", e))
            })
    }

    async fn reject(self: Box<Self>) -> Result<(), QueueError> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| QueueError::AckFailed(format!("Failed to terminate message: {}", e)))
    }
}
