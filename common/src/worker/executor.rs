// Execution unit: one refresh attempt for one leased watch

use crate::errors::ExecutionError;
use crate::models::{ExecutionResult, ExtractionOutcome, Watch};
use crate::notify::{ChangeEvent, Notifier};
use crate::queue::RefreshJob;
use crate::source::{DocumentSource, WindDown};
use crate::store::WatchStore;
use crate::worker::reconcile::reconcile;
use chrono::Utc;
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How an attempt that did not error ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A result with this outcome was appended
    Recorded(ExtractionOutcome),
    /// Another holder owns the lease now; nothing was written
    Duplicate,
    /// The watch is gone or inactive; the lease was released
    Skipped,
}

pub struct RefreshExecutor {
    store: Arc<dyn WatchStore>,
    notifier: Arc<dyn Notifier>,
    timezone: Tz,
}

impl RefreshExecutor {
    pub fn new(store: Arc<dyn WatchStore>, notifier: Arc<dyn Notifier>, timezone: Tz) -> Self {
        Self {
            store,
            notifier,
            timezone,
        }
    }

    /// Fetch, reconcile and record one refresh under the job's lease
    ///
    /// Writes go through `WatchStore::complete_lease`, so a redelivered job
    /// whose lease was already completed writes nothing.
    #[instrument(skip(self, source, wind_down), fields(watch_id = %job.watch_id, tier = %job.tier))]
    pub async fn execute(
        &self,
        source: &dyn DocumentSource,
        job: &RefreshJob,
        wind_down: &WindDown,
    ) -> Result<RefreshOutcome, ExecutionError> {
        let watch = match self.store.get_watch(job.watch_id).await? {
            Some(watch) if watch.active => watch,
            other => {
                info!(
                    missing = other.is_none(),
                    "Watch no longer refreshable, releasing lease"
                );
                self.store.release_lease(job.watch_id, job.lease_token).await?;
                return Ok(RefreshOutcome::Skipped);
            }
        };

        let criterion = watch.criterion()?;
        let fetched = source.fetch(&criterion, wind_down).await?;

        let executed_at = Utc::now();
        let previous = self.store.latest_result(watch.id).await?;
        let result = reconcile(watch.id, executed_at, fetched, previous.as_ref());

        let committed = self
            .store
            .complete_lease(watch.id, job.lease_token, Some(&result), Some(executed_at))
            .await?;
        if !committed {
            debug!("Lease no longer held, discarding result");
            return Ok(RefreshOutcome::Duplicate);
        }

        info!(outcome = %result.outcome, "Refresh recorded");

        if result.outcome == ExtractionOutcome::Success {
            self.dispatch_notification(&watch, &result);
        }

        Ok(RefreshOutcome::Recorded(result.outcome))
    }

    /// Fire-and-forget; the refresh is already committed
    fn dispatch_notification(&self, watch: &Watch, result: &ExecutionResult) {
        let event = ChangeEvent::new(watch, result, self.timezone);
        let notifier = Arc::clone(&self.notifier);

        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&event).await {
                warn!(watch_id = %event.watch_id, error = %e, "Change notification failed");
            }
        });
    }
}
