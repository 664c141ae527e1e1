// Scheduler engine: tier heartbeats that lease due watches and enqueue refreshes

use crate::config::Settings;
use crate::errors::SchedulerError;
use crate::models::{FrequencyTier, Watch};
use crate::queue::{JobMessage, JobPublisher, RefreshJob};
use crate::store::{DueCursor, WatchStore};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Heartbeat period of each tier
    pub heartbeats: HashMap<FrequencyTier, Duration>,
    /// Lease taken on a watch before its refresh is enqueued
    pub lease_ttl: Duration,
    /// Due watches read from the store per page
    pub scan_page_size: usize,
    /// Window over which each page of enqueues is spread
    pub enqueue_spread: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            heartbeats: FrequencyTier::ALL
                .iter()
                .map(|tier| (*tier, settings.scheduler.heartbeat(*tier)))
                .collect(),
            lease_ttl: settings.lease_ttl(),
            scan_page_size: settings.scheduler.scan_page_size,
            enqueue_spread: Duration::from_secs(settings.scheduler.enqueue_spread_seconds),
        }
    }

    pub fn heartbeat(&self, tier: FrequencyTier) -> Duration {
        self.heartbeats
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.interval().to_std().unwrap_or(Duration::from_secs(86_400)))
    }
}

/// Outcome of one tier heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub tier: FrequencyTier,
    /// Unleased due watches the store returned across all pages
    pub due: usize,
    pub enqueued: usize,
    /// Due watches leased by another scheduler between the read and the claim
    pub already_leased: usize,
}

/// Scheduler trait for watch scheduling operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run every tier heartbeat until `stop` is called
    async fn start(&self) -> Result<(), SchedulerError>;

    async fn stop(&self) -> Result<(), SchedulerError>;

    /// Enqueue refreshes for the due watches of one tier
    async fn scan_tier(&self, tier: FrequencyTier) -> Result<ScanReport, SchedulerError>;
}

/// Main scheduler engine implementation
///
/// Any number of engines may run at once: a watch is only enqueued by the
/// engine that wins its lease.
pub struct SchedulerEngine {
    config: SchedulerConfig,
    store: Arc<dyn WatchStore>,
    publisher: Arc<dyn JobPublisher>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn WatchStore>,
        publisher: Arc<dyn JobPublisher>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);

        Self {
            config,
            store,
            publisher,
            shutdown_tx,
        }
    }

    pub fn shutdown_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Scan `tier` as of `now`
    ///
    /// Walks the whole due set one page at a time, so every due watch gets a
    /// chance within a single heartbeat. A store failure aborts the heartbeat.
    /// A queue failure releases the lease just taken and aborts the rest of
    /// the heartbeat; jobs already enqueued stay enqueued.
    #[instrument(skip(self), fields(tier = %tier))]
    pub async fn scan_tier_at(
        &self,
        tier: FrequencyTier,
        now: DateTime<Utc>,
    ) -> Result<ScanReport, SchedulerError> {
        let page_size = self.config.scan_page_size.max(1);
        let mut report = ScanReport {
            tier,
            due: 0,
            enqueued: 0,
            already_leased: 0,
        };
        let mut cursor: Option<DueCursor> = None;

        loop {
            let page = self
                .store
                .list_due_watches(tier, now, cursor.as_ref(), page_size)
                .await?;
            report.due += page.len();
            debug!(page = page.len(), "Found due watches");

            self.enqueue_page(tier, now, &page, &mut report).await?;

            match page.last() {
                Some(last) if page.len() == page_size => cursor = Some(DueCursor::of(last)),
                _ => break,
            }
        }

        Ok(report)
    }

    async fn enqueue_page(
        &self,
        tier: FrequencyTier,
        now: DateTime<Utc>,
        watches: &[Watch],
        report: &mut ScanReport,
    ) -> Result<(), SchedulerError> {
        let pace = self.pace(watches.len());

        for (index, watch) in watches.iter().enumerate() {
            if index > 0 && !pace.is_zero() {
                sleep(jittered(pace)).await;
            }

            let token = Uuid::new_v4();
            if !self
                .store
                .try_acquire_lease(watch.id, token, self.config.lease_ttl)
                .await?
            {
                // Leased by another scheduler since the page was read
                debug!(watch_id = %watch.id, "Watch already leased, skipping");
                report.already_leased += 1;
                continue;
            }

            let message = JobMessage::Refresh(RefreshJob::new(watch.id, token, tier, now));
            if let Err(e) = self.publisher.publish(&message).await {
                warn!(watch_id = %watch.id, error = %e, "Queue unavailable, releasing lease");
                if let Err(release_err) = self.store.release_lease(watch.id, token).await {
                    // The lease will lapse on its own after its TTL
                    warn!(watch_id = %watch.id, error = %release_err, "Failed to release lease");
                }
                return Err(SchedulerError::Queue(e));
            }

            report.enqueued += 1;
            telemetry::record_job_enqueued(tier);
        }

        Ok(())
    }

    fn pace(&self, count: usize) -> Duration {
        if count <= 1 {
            return Duration::ZERO;
        }
        self.config.enqueue_spread / u32::try_from(count).unwrap_or(u32::MAX)
    }

    async fn heartbeat(&self, tier: FrequencyTier) {
        match self.scan_tier(tier).await {
            Ok(report) if report.enqueued > 0 || report.already_leased > 0 => {
                info!(
                    tier = %tier,
                    due = report.due,
                    enqueued = report.enqueued,
                    already_leased = report.already_leased,
                    "Heartbeat completed"
                );
            }
            Ok(_) => debug!(tier = %tier, "No watches due"),
            Err(e) => {
                let reason = match e {
                    SchedulerError::Store(_) => "store_unavailable",
                    SchedulerError::Queue(_) => "queue_unavailable",
                };
                telemetry::record_heartbeat_skipped(tier, reason);
                error!(tier = %tier, error = %e, "Heartbeat skipped");
            }
        }
    }

    async fn run_tier(&self, tier: FrequencyTier) {
        let period = self.config.heartbeat(tier);
        info!(tier = %tier, period_secs = period.as_secs(), "Starting tier heartbeat");

        // First tick fires immediately
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = ticker.tick() => self.heartbeat(tier).await,
                _ = shutdown_rx.recv() => {
                    info!(tier = %tier, "Shutdown signal received, stopping tier heartbeat");
                    break;
                }
            }
        }
    }
}

/// Spread enqueues by up to half a pace either way
fn jittered(pace: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    pace.mul_f64(factor)
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), SchedulerError> {
        info!("Starting scheduler engine");

        tokio::join!(
            self.run_tier(FrequencyTier::Daily),
            self.run_tier(FrequencyTier::Weekly),
            self.run_tier(FrequencyTier::Monthly),
        );

        info!("Scheduler engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), SchedulerError> {
        info!("Stopping scheduler engine");
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    async fn scan_tier(&self, tier: FrequencyTier) -> Result<ScanReport, SchedulerError> {
        self.scan_tier_at(tier, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.heartbeat(FrequencyTier::Daily), Duration::from_secs(3_600));
        assert_eq!(config.heartbeat(FrequencyTier::Weekly), Duration::from_secs(21_600));
        assert_eq!(config.heartbeat(FrequencyTier::Monthly), Duration::from_secs(86_400));
        assert_eq!(config.scan_page_size, 500);
        assert_eq!(config.lease_ttl, Duration::from_secs(780));
        assert!(config.enqueue_spread.is_zero());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let pace = Duration::from_millis(100);
        for _ in 0..100 {
            let delay = jittered(pace);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
