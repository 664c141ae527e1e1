// Watch Store: durable watches, append-only results and refresh leases

pub mod memory;
pub mod postgres;

pub use memory::InMemoryWatchStore;
pub use postgres::PgWatchStore;

use crate::errors::StoreError;
use crate::models::{ExecutionResult, FailureRecord, FrequencyTier, Watch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Keyset position in the due-watch order
/// `(last_execution NULLS FIRST, created_at, id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DueCursor {
    pub last_execution: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl DueCursor {
    pub fn of(watch: &Watch) -> Self {
        Self {
            last_execution: watch.last_execution,
            created_at: watch.created_at,
            id: watch.id,
        }
    }
}

/// Persistence contract shared by the scheduler and the workers
///
/// A lease is a (token, expiry) pair on a watch. At most one unexpired lease
/// exists per watch, and only the holder of a lease may record results for it.
#[async_trait]
pub trait WatchStore: Send + Sync {
    /// One page of the active, unleased watches of `tier` whose last
    /// execution is absent or at least one tier interval before `now`
    ///
    /// Pages follow the `DueCursor` order, never-executed first. Pass the
    /// cursor of the last watch of a page to get the next one.
    async fn list_due_watches(
        &self,
        tier: FrequencyTier,
        now: DateTime<Utc>,
        after: Option<&DueCursor>,
        limit: usize,
    ) -> Result<Vec<Watch>, StoreError>;

    async fn get_watch(&self, watch_id: Uuid) -> Result<Option<Watch>, StoreError>;

    /// Most recent result whose outcome is not `failed`
    async fn latest_result(&self, watch_id: Uuid) -> Result<Option<ExecutionResult>, StoreError>;

    /// Results of a watch, newest first
    async fn list_results(
        &self,
        watch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionResult>, StoreError>;

    /// Take the lease on an active watch if no unexpired lease exists
    async fn try_acquire_lease(
        &self,
        watch_id: Uuid,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Push the expiry of a lease still carrying `token`
    async fn renew_lease(&self, watch_id: Uuid, token: Uuid, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Drop the lease if it still carries `token`
    async fn release_lease(&self, watch_id: Uuid, token: Uuid) -> Result<bool, StoreError>;

    async fn append_result(&self, result: &ExecutionResult) -> Result<(), StoreError>;

    /// Advance the last execution timestamp; it never moves backwards
    async fn update_last_execution(
        &self,
        watch_id: Uuid,
        executed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_failure(&self, record: &FailureRecord) -> Result<(), StoreError>;

    /// Release the lease and, only if this caller was the one releasing it,
    /// append `result` and advance the last execution.
    ///
    /// Returns false when the lease was no longer held by `token`; nothing is
    /// written in that case.
    async fn complete_lease(
        &self,
        watch_id: Uuid,
        token: Uuid,
        result: Option<&ExecutionResult>,
        advance_to: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        if !self.release_lease(watch_id, token).await? {
            return Ok(false);
        }
        if let Some(result) = result {
            self.append_result(result).await?;
        }
        if let Some(executed_at) = advance_to {
            self.update_last_execution(watch_id, executed_at).await?;
        }
        Ok(true)
    }
}

/// Convert a lease TTL for timestamp arithmetic
pub(crate) fn ttl_as_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}
