// Job publisher implementation for NATS JetStream

use crate::errors::QueueError;
use crate::queue::message::JobMessage;
use crate::queue::nats::NatsClient;
use async_nats::jetstream::context::PublishAckFuture;
use async_trait::async_trait;
use tracing::{debug, instrument};

/// JobPublisher hands jobs to the dispatch queue
///
/// Publishing fails fast with `QueueError::Unavailable` when the broker does
/// not confirm the message; callers decide whether to retry later.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError>;
}

/// NATS-based job publisher implementation
pub struct NatsJobPublisher {
    client: NatsClient,
}

impl NatsJobPublisher {
    pub fn new(client: NatsClient) -> Self {
        Self { client }
    }

    fn subject(&self, message: &JobMessage) -> String {
        format!("{}.{}", self.client.config().subject, message.kind())
    }
}

#[async_trait]
impl JobPublisher for NatsJobPublisher {
    #[instrument(skip(self, message), fields(
        watch_id = %message.watch_id(),
        dedup_key = %message.dedup_key()
    ))]
    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError> {
        let payload = message.encode()?;
        let subject = self.subject(message);

        // The broker drops a second publish with the same Nats-Msg-Id
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.dedup_key().as_str());
        headers.insert("Watch-Id", message.watch_id().to_string().as_str());

        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::Unavailable(format!("Failed to publish message: {}", e)))?;

        let publish_timeout = self.client.config().publish_timeout;
        match tokio::time::timeout(publish_timeout, publish_future).await {
            Ok(Ok(ack)) => {
                debug!(
                    subject = %subject,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "Job published"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::Unavailable(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Unavailable(format!(
                "Publish acknowledgment timeout after {:?}",
                publish_timeout
            ))),
        }
    }
}
