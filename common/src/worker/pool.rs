// Worker pool: fixed slots, one job and one source session per slot

use crate::config::WorkerSettings;
use crate::queue::JobSource;
use crate::source::{DocumentSource, DocumentSourceFactory};
use crate::telemetry;
use crate::worker::supervisor::Supervisor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub pool_size: usize,
    /// Jobs a session serves before it is closed and replaced
    pub max_jobs_per_worker: u32,
    /// Longest a slot blocks on an empty queue before checking for shutdown
    pub poll_wait: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_jobs_per_worker: 100,
            poll_wait: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            pool_size: settings.pool_size,
            max_jobs_per_worker: settings.max_jobs_per_worker,
            poll_wait: Duration::from_secs(settings.poll_wait_seconds),
        }
    }
}

/// Pool of worker slots pulling refresh jobs
///
/// Each slot takes one job at a time, so no slot ever holds a job it is not
/// working on. A slot recycles its source session after
/// `max_jobs_per_worker` jobs to bound resource growth.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    jobs: Arc<dyn JobSource>,
    sources: Arc<dyn DocumentSourceFactory>,
    supervisor: Arc<Supervisor>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        jobs: Arc<dyn JobSource>,
        sources: Arc<dyn DocumentSourceFactory>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            config,
            jobs,
            sources,
            supervisor,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    /// Run every slot until shutdown is requested and in-flight jobs finish
    #[instrument(skip(self), fields(pool_size = self.config.pool_size))]
    pub async fn run(&self) {
        info!("Starting worker pool");

        let mut slots = JoinSet::new();
        for id in 0..self.config.pool_size {
            let slot = Slot {
                id,
                config: self.config.clone(),
                jobs: Arc::clone(&self.jobs),
                sources: Arc::clone(&self.sources),
                supervisor: Arc::clone(&self.supervisor),
                shutdown_flag: Arc::clone(&self.shutdown_flag),
                shutdown_notify: Arc::clone(&self.shutdown_notify),
            };
            slots.spawn(slot.run());
        }

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker slot terminated abnormally");
            }
        }

        info!("Worker pool stopped");
    }

    /// Stop taking new jobs; jobs already running complete first
    pub fn shutdown(&self) {
        info!("Worker pool shutdown requested");
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }
}

struct Slot {
    id: usize,
    config: WorkerPoolConfig,
    jobs: Arc<dyn JobSource>,
    sources: Arc<dyn DocumentSourceFactory>,
    supervisor: Arc<Supervisor>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl Slot {
    fn stopping(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    async fn run(self) {
        while !self.stopping() {
            let session = match self.sources.create().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(slot = self.id, error = %e, "Failed to open source session");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_wait) => {}
                        _ = self.shutdown_notify.notified() => {}
                    }
                    continue;
                }
            };

            let processed = self.serve(session.as_ref()).await;
            session.close().await;

            if processed >= self.config.max_jobs_per_worker {
                info!(slot = self.id, processed, "Recycling worker session");
                telemetry::record_worker_recycled();
            }
        }
    }

    /// Serve jobs with one session until it is used up or shutdown begins
    async fn serve(&self, session: &dyn DocumentSource) -> u32 {
        let mut processed = 0;

        while processed < self.config.max_jobs_per_worker && !self.stopping() {
            let next = tokio::select! {
                next = self.jobs.next(self.config.poll_wait) => next,
                _ = self.shutdown_notify.notified() => break,
            };

            match next {
                Ok(Some(delivery)) => {
                    let report = self.supervisor.supervise(session, delivery).await;
                    processed += 1;
                    tracing::debug!(
                        slot = self.id,
                        watch_id = %report.watch_id,
                        state = %report.state,
                        "Delivery settled"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(slot = self.id, error = %e, "Failed to fetch job");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        processed
    }
}
