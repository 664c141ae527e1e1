// In-memory dispatch queue with broker-like delivery semantics

use crate::errors::QueueError;
use crate::queue::consumer::{Delivery, JobSource};
use crate::queue::message::JobMessage;
use crate::queue::publisher::JobPublisher;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Pending {
    message: JobMessage,
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    delayed: Vec<(Instant, Pending)>,
    in_flight: usize,
    seen_keys: HashSet<String>,
    acked: Vec<JobMessage>,
    rejected: Vec<JobMessage>,
    published: usize,
    unavailable: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, pending) = self.delayed.remove(index);
                self.ready.push_back(pending);
            } else {
                index += 1;
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Queue used by tests and single-process runs
///
/// Publishing deduplicates on `JobMessage::dedup_key`, deliveries count
/// attempts, `retry` honours its delay, and a delivery dropped without being
/// settled goes back to the front of the queue as a crashed worker's would.
#[derive(Clone)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Make publishing fail with `QueueError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.lock().unavailable = unavailable;
    }

    /// Enqueue a message bypassing deduplication, as a broker redelivery would
    pub fn push_duplicate(&self, message: JobMessage) {
        self.shared.lock().ready.push_back(Pending {
            message,
            deliveries: 0,
        });
        self.shared.notify.notify_one();
    }

    /// Messages waiting for delivery, including delayed ones
    pub fn pending(&self) -> usize {
        let state = self.shared.lock();
        state.ready.len() + state.delayed.len()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }

    /// Publishes accepted after deduplication
    pub fn published(&self) -> usize {
        self.shared.lock().published
    }

    pub fn acked(&self) -> Vec<JobMessage> {
        self.shared.lock().acked.clone()
    }

    pub fn rejected(&self) -> Vec<JobMessage> {
        self.shared.lock().rejected.clone()
    }

    /// Messages queued right now, in delivery order
    pub fn snapshot(&self) -> Vec<JobMessage> {
        let state = self.shared.lock();
        state
            .ready
            .iter()
            .chain(state.delayed.iter().map(|(_, pending)| pending))
            .map(|pending| pending.message.clone())
            .collect()
    }

    fn try_take(&self) -> Result<Option<Pending>, Option<Instant>> {
        let mut state = self.shared.lock();
        state.promote_due(Instant::now());
        match state.ready.pop_front() {
            Some(mut pending) => {
                pending.deliveries += 1;
                state.in_flight += 1;
                Ok(Some(pending))
            }
            None => Err(state.next_wakeup()),
        }
    }
}

#[async_trait]
impl JobPublisher for InMemoryQueue {
    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError> {
        {
            let mut state = self.shared.lock();
            if state.unavailable {
                return Err(QueueError::Unavailable(
                    "in-memory queue marked unavailable".to_string(),
                ));
            }
            if !state.seen_keys.insert(message.dedup_key()) {
                return Ok(());
            }
            state.published += 1;
            state.ready.push_back(Pending {
                message: message.clone(),
                deliveries: 0,
            });
        }
        self.shared.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl JobSource for InMemoryQueue {
    async fn next(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let wake_at = match self.try_take() {
                Ok(Some(pending)) => {
                    return Ok(Some(Box::new(InMemoryDelivery {
                        shared: Arc::clone(&self.shared),
                        pending: Some(pending),
                    })));
                }
                Ok(None) => deadline,
                Err(next_delayed) => next_delayed.map_or(deadline, |at| at.min(deadline)),
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

struct InMemoryDelivery {
    shared: Arc<Shared>,
    /// Taken when the delivery is settled
    pending: Option<Pending>,
}

impl InMemoryDelivery {
    fn settle(mut self: Box<Self>) -> Option<Pending> {
        let pending = self.pending.take();
        if pending.is_some() {
            self.shared.lock().in_flight -= 1;
        }
        pending
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn message(&self) -> &JobMessage {
        match &self.pending {
            Some(pending) => &pending.message,
            None => unreachable!("delivery inspected after being settled"),
        }
    }

    fn delivery_count(&self) -> u32 {
        self.pending.as_ref().map_or(0, |pending| pending.deliveries)
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let shared = Arc::clone(&self.shared);
        if let Some(pending) = self.settle() {
            shared.lock().acked.push(pending.message);
        }
        Ok(())
    }

    async fn retry(self: Box<Self>, delay: Duration) -> Result<(), QueueError> {
        let shared = Arc::clone(&self.shared);
        if let Some(pending) = self.settle() {
            let mut state = shared.lock();
            if delay.is_zero() {
                state.ready.push_back(pending);
            } else {
                state.delayed.push((Instant::now() + delay, pending));
            }
        }
        shared.notify.notify_one();
        Ok(())
    }

    async fn reject(self: Box<Self>) -> Result<(), QueueError> {
        let shared = Arc::clone(&self.shared);
        if let Some(pending) = self.settle() {
            shared.lock().rejected.push(pending.message);
        }
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            let mut state = self.shared.lock();
            state.in_flight -= 1;
            state.ready.push_front(pending);
            drop(state);
            self.shared.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FrequencyTier;
    use crate::queue::message::RefreshJob;
    use chrono::Utc;
    use uuid::Uuid;

    fn job() -> JobMessage {
        JobMessage::Refresh(RefreshJob::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            FrequencyTier::Daily,
            Utc::now(),
        ))
    }

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_publish_deduplicates_by_key() {
        let queue = InMemoryQueue::new();
        let message = job();

        queue.publish(&message).await.unwrap();
        queue.publish(&message).await.unwrap();

        assert_eq!(queue.published(), 1);
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_queue_refuses_publish() {
        let queue = InMemoryQueue::new();
        queue.set_unavailable(true);
        assert!(matches!(
            queue.publish(&job()).await,
            Err(QueueError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let queue = InMemoryQueue::new();
        let message = job();
        queue.publish(&message).await.unwrap();

        let delivery = queue.next(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count(), 1);
        assert_eq!(queue.in_flight(), 1);
        delivery.ack().await.unwrap();

        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.acked(), vec![message]);
        assert!(queue.next(WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_redelivered() {
        let queue = InMemoryQueue::new();
        queue.publish(&job()).await.unwrap();

        let first = queue.next(WAIT).await.unwrap().unwrap();
        drop(first);

        let second = queue.next(WAIT).await.unwrap().unwrap();
        assert_eq!(second.delivery_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_delay() {
        let queue = InMemoryQueue::new();
        queue.publish(&job()).await.unwrap();

        let delivery = queue.next(WAIT).await.unwrap().unwrap();
        delivery.retry(Duration::from_secs(60)).await.unwrap();

        assert!(queue.next(Duration::from_secs(59)).await.unwrap().is_none());
        let again = queue.next(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(again.delivery_count(), 2);
    }

    #[tokio::test]
    async fn test_reject_drops_message() {
        let queue = InMemoryQueue::new();
        queue.publish(&job()).await.unwrap();

        queue.next(WAIT).await.unwrap().unwrap().reject().await.unwrap();
        assert_eq!(queue.rejected().len(), 1);
        assert_eq!(queue.pending(), 0);
    }
}
