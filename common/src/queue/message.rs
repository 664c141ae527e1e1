// Message format for jobs travelling through the dispatch queue

use crate::errors::QueueError;
use crate::models::FrequencyTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every job the queue can carry
///
/// The set is closed; a payload that does not decode into one of these
/// variants is rejected by the consumer instead of being retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobMessage {
    Refresh(RefreshJob),
}

/// Refresh one watch under the lease taken by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshJob {
    pub watch_id: Uuid,
    /// Token of the lease the scheduler acquired before enqueueing
    pub lease_token: Uuid,
    pub tier: FrequencyTier,
    pub enqueued_at: DateTime<Utc>,
}

impl RefreshJob {
    pub fn new(watch_id: Uuid, lease_token: Uuid, tier: FrequencyTier, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            watch_id,
            lease_token,
            tier,
            enqueued_at,
        }
    }
}

impl JobMessage {
    pub fn watch_id(&self) -> Uuid {
        match self {
            JobMessage::Refresh(job) => job.watch_id,
        }
    }

    /// Broker-side deduplication key; one per lease
    pub fn dedup_key(&self) -> String {
        match self {
            JobMessage::Refresh(job) => format!("refresh:{}:{}", job.watch_id, job.lease_token),
        }
    }

    /// Subject token appended to the stream's subject prefix
    pub fn kind(&self) -> &'static str {
        match self {
            JobMessage::Refresh(_) => "refresh",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(|e| {
            QueueError::SerializationFailed(format!("Failed to serialize job message: {}", e))
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(payload).map_err(|e| {
            QueueError::DeserializationFailed(format!("Failed to deserialize job message: {}", e))
        })
    }
}
