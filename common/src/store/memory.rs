// In-memory Watch Store used by tests and local runs

use super::{ttl_as_chrono, DueCursor, WatchStore};
use crate::errors::StoreError;
use crate::models::{ExecutionResult, ExtractionOutcome, FailureRecord, FrequencyTier, Watch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct Inner {
    watches: HashMap<Uuid, Watch>,
    leases: HashMap<Uuid, Lease>,
    results: Vec<ExecutionResult>,
    failures: Vec<FailureRecord>,
    unavailable: bool,
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn release(&mut self, watch_id: Uuid, token: Uuid) -> bool {
        match self.leases.get(&watch_id) {
            Some(lease) if lease.token == token => {
                self.leases.remove(&watch_id);
                true
            }
            _ => false,
        }
    }

    fn advance(&mut self, watch_id: Uuid, executed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let watch = self
            .watches
            .get_mut(&watch_id)
            .ok_or_else(|| StoreError::QueryFailed(format!("Watch not found: {}", watch_id)))?;
        watch.last_execution = Some(match watch.last_execution {
            Some(previous) => previous.max(executed_at),
            None => executed_at,
        });
        Ok(())
    }
}

/// Mutex-guarded store with the same lease semantics as the Postgres store
#[derive(Default)]
pub struct InMemoryWatchStore {
    inner: Mutex<Inner>,
}

impl InMemoryWatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_watch(&self, watch: Watch) {
        self.inner.lock().await.watches.insert(watch.id, watch);
    }

    pub async fn set_active(&self, watch_id: Uuid, active: bool) {
        if let Some(watch) = self.inner.lock().await.watches.get_mut(&watch_id) {
            watch.active = active;
        }
    }

    pub async fn set_last_execution(&self, watch_id: Uuid, at: Option<DateTime<Utc>>) {
        if let Some(watch) = self.inner.lock().await.watches.get_mut(&watch_id) {
            watch.last_execution = at;
        }
    }

    /// Make every operation fail with `StoreError::Unavailable`
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Results of a watch in insertion order
    pub async fn results_for(&self, watch_id: Uuid) -> Vec<ExecutionResult> {
        self.inner
            .lock()
            .await
            .results
            .iter()
            .filter(|r| r.watch_id == watch_id)
            .cloned()
            .collect()
    }

    pub async fn failures(&self) -> Vec<FailureRecord> {
        self.inner.lock().await.failures.clone()
    }

    /// Token of the unexpired lease on a watch, if any
    pub async fn lease_holder(&self, watch_id: Uuid) -> Option<Uuid> {
        let now = Utc::now();
        self.inner
            .lock()
            .await
            .leases
            .get(&watch_id)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.token)
    }
}

#[async_trait]
impl WatchStore for InMemoryWatchStore {
    async fn list_due_watches(
        &self,
        tier: FrequencyTier,
        now: DateTime<Utc>,
        after: Option<&DueCursor>,
        limit: usize,
    ) -> Result<Vec<Watch>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_available()?;

        let clock = Utc::now();
        let mut due: Vec<Watch> = inner
            .watches
            .values()
            .filter(|w| w.tier == tier && w.is_due(now))
            .filter(|w| !inner.leases.get(&w.id).is_some_and(|lease| lease.is_live(clock)))
            .filter(|w| after.map_or(true, |cursor| DueCursor::of(w) > *cursor))
            .cloned()
            .collect();
        // None sorts before Some, matching NULLS FIRST
        due.sort_by_key(DueCursor::of);
        due.truncate(limit);
        Ok(due)
    }

    async fn get_watch(&self, watch_id: Uuid) -> Result<Option<Watch>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner.watches.get(&watch_id).cloned())
    }

    async fn latest_result(&self, watch_id: Uuid) -> Result<Option<ExecutionResult>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner
            .results
            .iter()
            .rev()
            .find(|r| r.watch_id == watch_id && r.outcome != ExtractionOutcome::Failed)
            .cloned())
    }

    async fn list_results(
        &self,
        watch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionResult>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_available()?;

        // Stable sort keeps later insertions first among equal timestamps
        let mut results: Vec<ExecutionResult> = inner
            .results
            .iter()
            .rev()
            .filter(|r| r.watch_id == watch_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        results.truncate(limit);
        Ok(results)
    }

    async fn try_acquire_lease(
        &self,
        watch_id: Uuid,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        let now = Utc::now();
        match inner.watches.get(&watch_id) {
            Some(watch) if watch.active => {}
            _ => return Ok(false),
        }
        if inner.leases.get(&watch_id).is_some_and(|lease| lease.is_live(now)) {
            return Ok(false);
        }

        inner.leases.insert(
            watch_id,
            Lease {
                token,
                expires_at: now + ttl_as_chrono(ttl),
            },
        );
        Ok(true)
    }

    async fn renew_lease(
        &self,
        watch_id: Uuid,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        match inner.leases.get_mut(&watch_id) {
            Some(lease) if lease.token == token => {
                lease.expires_at = Utc::now() + ttl_as_chrono(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, watch_id: Uuid, token: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner.release(watch_id, token))
    }

    async fn append_result(&self, result: &ExecutionResult) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.results.push(result.clone());
        Ok(())
    }

    async fn update_last_execution(
        &self,
        watch_id: Uuid,
        executed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.advance(watch_id, executed_at)
    }

    async fn record_failure(&self, record: &FailureRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.failures.push(record.clone());
        Ok(())
    }

    async fn complete_lease(
        &self,
        watch_id: Uuid,
        token: Uuid,
        result: Option<&ExecutionResult>,
        advance_to: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        // One critical section so a concurrent holder never sees a partial write
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        if !inner.release(watch_id, token) {
            return Ok(false);
        }
        if let Some(result) = result {
            inner.results.push(result.clone());
        }
        if let Some(executed_at) = advance_to {
            inner.advance(watch_id, executed_at)?;
        }
        Ok(true)
    }
}
