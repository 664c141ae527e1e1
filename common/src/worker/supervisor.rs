// Retry and lifecycle supervision of refresh attempts

use crate::errors::{ExecutionError, QueueError};
use crate::models::{ExecutionResult, FailureRecord};
use crate::queue::{Delivery, JobMessage, RefreshJob};
use crate::retry::{AttemptEvent, AttemptState, LifecyclePolicy, RetryStrategy};
use crate::source::{DocumentSource, WindDown};
use crate::store::WatchStore;
use crate::telemetry;
use crate::worker::executor::{RefreshExecutor, RefreshOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Reason recorded when every allowed delivery was lost before completing
const REDELIVERY_EXHAUSTED: &str = "redelivery_exhausted";

/// What the supervisor did with one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub watch_id: Uuid,
    pub attempt: u32,
    pub state: AttemptState,
    pub outcome: Option<RefreshOutcome>,
    pub failure_reason: Option<&'static str>,
}

/// Runs each delivery through the attempt state machine and settles it
///
/// Success and terminal failure ack the delivery, a retryable failure asks the
/// queue to redeliver it after the fixed retry delay.
pub struct Supervisor {
    executor: Arc<RefreshExecutor>,
    store: Arc<dyn WatchStore>,
    policy: LifecyclePolicy,
    lease_ttl: Duration,
}

impl Supervisor {
    pub fn new(
        executor: Arc<RefreshExecutor>,
        store: Arc<dyn WatchStore>,
        policy: LifecyclePolicy,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            policy,
            lease_ttl,
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    #[instrument(skip(self, source, delivery), fields(
        watch_id = %delivery.message().watch_id(),
        attempt = delivery.delivery_count()
    ))]
    pub async fn supervise(
        &self,
        source: &dyn DocumentSource,
        delivery: Box<dyn Delivery>,
    ) -> AttemptReport {
        let JobMessage::Refresh(job) = delivery.message().clone();
        let attempt = delivery.delivery_count().max(1);
        let mut report = AttemptReport {
            watch_id: job.watch_id,
            attempt,
            state: AttemptState::Dispatched,
            outcome: None,
            failure_reason: None,
        };

        // Crashed workers can burn deliveries without reaching a verdict
        if attempt > self.policy.retry.max_retries() {
            warn!("Delivery limit reached without a completed attempt");
            self.fail_terminally(&job, attempt - 1, REDELIVERY_EXHAUSTED).await;
            settle(delivery.ack().await, "ack");
            report.state = AttemptState::TerminalFailure;
            report.failure_reason = Some(REDELIVERY_EXHAUSTED);
            return report;
        }

        let state = report.state.on(AttemptEvent::Started, attempt, &self.policy.retry);
        let started = Instant::now();
        let result = self.run_attempt(source, &job).await;
        telemetry::record_refresh_duration(started.elapsed().as_secs_f64());

        let event = match &result {
            Ok(_) => AttemptEvent::Completed,
            Err(ExecutionError::Timeout(_)) => AttemptEvent::HardLimitExceeded,
            Err(e) => AttemptEvent::Failed {
                retryable: e.is_retryable(),
            },
        };
        report.state = state.on(event, attempt, &self.policy.retry);

        match (report.state, result) {
            (AttemptState::Succeeded, Ok(outcome)) => {
                match outcome {
                    RefreshOutcome::Recorded(extraction) => {
                        telemetry::record_refresh_outcome(extraction)
                    }
                    RefreshOutcome::Duplicate => telemetry::record_duplicate_delivery(),
                    RefreshOutcome::Skipped => {}
                }
                report.outcome = Some(outcome);
                settle(delivery.ack().await, "ack");
            }
            (AttemptState::RetryableFailure, Err(e)) => {
                let delay = self
                    .policy
                    .retry
                    .next_delay(attempt)
                    .unwrap_or(Duration::ZERO);
                warn!(
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "Refresh attempt failed, scheduling retry"
                );
                telemetry::record_refresh_retry();
                report.failure_reason = Some(e.reason());
                settle(delivery.retry(delay).await, "retry");
            }
            (AttemptState::TerminalFailure, Err(e)) => {
                error!(error = %e, "Refresh failed terminally");
                report.failure_reason = Some(e.reason());
                self.fail_terminally(&job, attempt, e.reason()).await;
                settle(delivery.ack().await, "ack");
            }
            (state, _) => {
                // The state machine only produces the three arms above here
                error!(state = %state, "Unexpected attempt state, leaving delivery for redelivery");
            }
        }

        report
    }

    /// One attempt bounded by the soft and hard time limits
    async fn run_attempt(
        &self,
        source: &dyn DocumentSource,
        job: &RefreshJob,
    ) -> Result<RefreshOutcome, ExecutionError> {
        let (trigger, wind_down) = WindDown::channel();

        let work = async {
            if !self
                .store
                .renew_lease(job.watch_id, job.lease_token, self.lease_ttl)
                .await?
            {
                debug!("Lease no longer held, skipping attempt");
                return Ok(RefreshOutcome::Duplicate);
            }
            self.executor.execute(source, job, &wind_down).await
        };

        let supervised = async {
            tokio::pin!(work);
            let soft_limit = tokio::time::sleep(self.policy.soft_limit);
            tokio::pin!(soft_limit);
            let mut wind_down_sent = false;

            loop {
                tokio::select! {
                    result = &mut work => return result,
                    _ = &mut soft_limit, if !wind_down_sent => {
                        warn!(
                            soft_limit_secs = self.policy.soft_limit.as_secs(),
                            "Soft time limit reached, asking source to wind down"
                        );
                        wind_down_sent = true;
                        trigger.fire();
                    }
                }
            }
        };

        match tokio::time::timeout(self.policy.hard_limit, supervised).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(self.policy.hard_limit.as_secs())),
        }
    }

    /// Release the lease, append a `failed` result and leave a failure record
    ///
    /// The last execution is not advanced, so the next heartbeat of the tier
    /// selects the watch again.
    async fn fail_terminally(&self, job: &RefreshJob, attempts: u32, reason: &str) {
        let failed = ExecutionResult::failed(job.watch_id, Utc::now());

        match self
            .store
            .complete_lease(job.watch_id, job.lease_token, Some(&failed), None)
            .await
        {
            Ok(true) => {
                let record = FailureRecord::new(job.watch_id, job.lease_token, attempts, reason);
                if let Err(e) = self.store.record_failure(&record).await {
                    error!(error = %e, "Failed to write failure record");
                }
                telemetry::record_terminal_failure(reason);
                telemetry::alert_terminal_failure(&job.watch_id, attempts, reason);
            }
            Ok(false) => {
                info!("Lease already released by another holder, not recording failure");
            }
            Err(e) => {
                // The lease expires on its own and the watch stays due
                error!(error = %e, "Failed to record terminal failure");
            }
        }
    }
}

fn settle(result: Result<(), QueueError>, action: &str) {
    if let Err(e) = result {
        // The broker will redeliver; the lease keeps the redelivery harmless
        warn!(action, error = %e, "Failed to settle delivery");
    }
}
