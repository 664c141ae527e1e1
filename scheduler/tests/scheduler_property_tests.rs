// Property-based and scenario tests for the frequency scheduler

use chrono::{Duration as ChronoDuration, Utc};
use common::errors::SchedulerError;
use common::models::{ExecutionResult, ExtractionOutcome, FrequencyTier, Watch};
use common::queue::{InMemoryQueue, JobMessage, JobPublisher};
use common::scheduler::{ScanReport, Scheduler, SchedulerConfig, SchedulerEngine};
use common::store::{InMemoryWatchStore, WatchStore};
use futures::future::join_all;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DOCKET: &str = "11001310300320190012300";

fn engine(store: &Arc<InMemoryWatchStore>, queue: &InMemoryQueue) -> SchedulerEngine {
    SchedulerEngine::new(
        SchedulerConfig::default(),
        Arc::clone(store) as Arc<dyn WatchStore>,
        Arc::new(queue.clone()) as Arc<dyn JobPublisher>,
    )
}

async fn seed(store: &InMemoryWatchStore, tier: FrequencyTier, count: usize) -> Vec<Uuid> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let watch = Watch::by_docket(Uuid::new_v4(), DOCKET, tier);
        ids.push(watch.id);
        store.insert_watch(watch).await;
    }
    ids
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn tier_strategy() -> impl Strategy<Value = FrequencyTier> {
    prop_oneof![
        Just(FrequencyTier::Daily),
        Just(FrequencyTier::Weekly),
        Just(FrequencyTier::Monthly),
    ]
}

proptest! {
    /// A watch is enqueued exactly when a full tier interval has passed since
    /// its last execution.
    #[test]
    fn property_due_boundary(tier in tier_strategy(), offset_secs in -7200i64..7200i64) {
        runtime().block_on(async {
            let store = Arc::new(InMemoryWatchStore::new());
            let queue = InMemoryQueue::new();
            let ids = seed(&store, tier, 1).await;

            let now = Utc::now();
            let last = now - tier.interval() + ChronoDuration::seconds(offset_secs);
            store.set_last_execution(ids[0], Some(last)).await;

            let report = engine(&store, &queue).scan_tier_at(tier, now).await.unwrap();
            let expected = usize::from(offset_secs <= 0);
            prop_assert_eq!(report.enqueued, expected);
            prop_assert_eq!(queue.published(), expected);
            Ok(())
        })?;
    }

    /// However many schedulers scan at once, each due watch is enqueued once.
    #[test]
    fn property_each_due_watch_enqueued_once(watches in 1usize..20, schedulers in 1usize..5) {
        runtime().block_on(async {
            let store = Arc::new(InMemoryWatchStore::new());
            let queue = InMemoryQueue::new();
            let ids = seed(&store, FrequencyTier::Daily, watches).await;

            let now = Utc::now();
            let engines: Vec<_> = (0..schedulers).map(|_| engine(&store, &queue)).collect();
            let reports = scan_concurrently(&engines, now).await;

            let enqueued: usize = reports.iter().map(|r| r.enqueued).sum();
            prop_assert_eq!(enqueued, watches);

            let mut seen: Vec<Uuid> = queue.snapshot().iter().map(JobMessage::watch_id).collect();
            seen.sort();
            let mut expected = ids.clone();
            expected.sort();
            prop_assert_eq!(seen, expected);
            Ok(())
        })?;
    }
}

async fn scan_concurrently(
    engines: &[SchedulerEngine],
    now: chrono::DateTime<Utc>,
) -> Vec<ScanReport> {
    join_all(
        engines
            .iter()
            .map(|engine| engine.scan_tier_at(FrequencyTier::Daily, now)),
    )
    .await
    .into_iter()
    .map(Result::unwrap)
    .collect()
}

#[tokio::test]
async fn test_enqueued_job_carries_the_live_lease_token() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    let ids = seed(&store, FrequencyTier::Weekly, 1).await;

    engine(&store, &queue)
        .scan_tier_at(FrequencyTier::Weekly, Utc::now())
        .await
        .unwrap();

    let messages = queue.snapshot();
    assert_eq!(messages.len(), 1);
    let JobMessage::Refresh(job) = &messages[0];
    assert_eq!(job.watch_id, ids[0]);
    assert_eq!(job.tier, FrequencyTier::Weekly);
    assert_eq!(store.lease_holder(ids[0]).await, Some(job.lease_token));
}

#[tokio::test]
async fn test_second_heartbeat_skips_watches_still_leased() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    seed(&store, FrequencyTier::Daily, 3).await;
    let scheduler = engine(&store, &queue);

    let first = scheduler
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await
        .unwrap();
    let second = scheduler
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await
        .unwrap();

    assert_eq!(first.enqueued, 3);
    assert_eq!(second.due, 0);
    assert_eq!(second.enqueued, 0);
    assert_eq!(queue.published(), 3);
}

#[tokio::test]
async fn test_watch_leased_elsewhere_is_not_enqueued() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    let ids = seed(&store, FrequencyTier::Daily, 2).await;
    let holder = Uuid::new_v4();
    assert!(store
        .try_acquire_lease(ids[0], holder, Duration::from_secs(600))
        .await
        .unwrap());

    let report = engine(&store, &queue)
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await
        .unwrap();

    assert_eq!(report.due, 1);
    assert_eq!(report.enqueued, 1);
    assert_eq!(store.lease_holder(ids[0]).await, Some(holder));
    assert_eq!(queue.snapshot()[0].watch_id(), ids[1]);
}

#[tokio::test]
async fn test_only_the_scanned_tier_is_enqueued() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    seed(&store, FrequencyTier::Daily, 2).await;
    let monthly = seed(&store, FrequencyTier::Monthly, 1).await;

    let report = engine(&store, &queue)
        .scan_tier_at(FrequencyTier::Monthly, Utc::now())
        .await
        .unwrap();

    assert_eq!(report.enqueued, 1);
    assert_eq!(queue.snapshot()[0].watch_id(), monthly[0]);
}

#[tokio::test]
async fn test_inactive_watches_are_never_enqueued() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    let ids = seed(&store, FrequencyTier::Daily, 2).await;
    store.set_active(ids[1], false).await;

    let report = engine(&store, &queue)
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await
        .unwrap();

    assert_eq!(report.due, 1);
    assert_eq!(report.enqueued, 1);
    assert_eq!(queue.snapshot()[0].watch_id(), ids[0]);
}

#[tokio::test]
async fn test_queue_outage_releases_lease_and_keeps_watch_due() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    let ids = seed(&store, FrequencyTier::Daily, 1).await;
    queue.set_unavailable(true);
    let scheduler = engine(&store, &queue);

    let result = scheduler
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await;

    assert!(matches!(result, Err(SchedulerError::Queue(_))));
    assert_eq!(store.lease_holder(ids[0]).await, None);
    assert!(store.results_for(ids[0]).await.is_empty());

    // Next heartbeat after recovery picks the watch up again
    queue.set_unavailable(false);
    let report = scheduler
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.enqueued, 1);
}

#[tokio::test]
async fn test_store_outage_skips_heartbeat() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    seed(&store, FrequencyTier::Daily, 2).await;
    store.set_unavailable(true).await;

    let result = engine(&store, &queue)
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await;

    assert!(matches!(result, Err(SchedulerError::Store(_))));
    assert_eq!(queue.published(), 0);
}

#[tokio::test]
async fn test_daily_scenario_refreshes_once_per_day() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    let ids = seed(&store, FrequencyTier::Daily, 1).await;
    let scheduler = engine(&store, &queue);
    let now = Utc::now();

    // Executed 23 hours ago: not due yet
    store
        .set_last_execution(ids[0], Some(now - ChronoDuration::hours(23)))
        .await;
    let report = scheduler
        .scan_tier_at(FrequencyTier::Daily, now)
        .await
        .unwrap();
    assert_eq!(report.due, 0);

    // One hour later it is due
    let later = now + ChronoDuration::hours(1);
    let report = scheduler
        .scan_tier_at(FrequencyTier::Daily, later)
        .await
        .unwrap();
    assert_eq!(report.enqueued, 1);
}

fn paged_engine(
    store: &Arc<InMemoryWatchStore>,
    queue: &InMemoryQueue,
    page_size: usize,
) -> SchedulerEngine {
    let config = SchedulerConfig {
        scan_page_size: page_size,
        ..SchedulerConfig::default()
    };
    SchedulerEngine::new(
        config,
        Arc::clone(store) as Arc<dyn WatchStore>,
        Arc::new(queue.clone()) as Arc<dyn JobPublisher>,
    )
}

/// Settle every queued job: `failing` watches fail terminally, the rest refresh
async fn settle_jobs(store: &InMemoryWatchStore, queue: &InMemoryQueue, failing: &[Uuid]) {
    let now = Utc::now();
    for message in queue.snapshot() {
        let JobMessage::Refresh(job) = message;
        if failing.contains(&job.watch_id) {
            let result = ExecutionResult::failed(job.watch_id, now);
            store
                .complete_lease(job.watch_id, job.lease_token, Some(&result), None)
                .await
                .unwrap();
        } else {
            let result = ExecutionResult::new(job.watch_id, now, None, ExtractionOutcome::NotFound);
            store
                .complete_lease(job.watch_id, job.lease_token, Some(&result), Some(now))
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn test_one_heartbeat_enqueues_every_due_watch_across_pages() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    let mut ids = seed(&store, FrequencyTier::Daily, 5).await;

    let report = paged_engine(&store, &queue, 2)
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await
        .unwrap();

    assert_eq!(report.due, 5);
    assert_eq!(report.enqueued, 5);
    let mut seen: Vec<Uuid> = queue.snapshot().iter().map(JobMessage::watch_id).collect();
    seen.sort();
    ids.sort();
    assert_eq!(seen, ids);
}

#[tokio::test]
async fn test_failing_watches_do_not_starve_healthy_ones() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    let now = Utc::now();

    // Never-executed watches sort first and keep failing
    let failing = seed(&store, FrequencyTier::Daily, 2).await;
    let healthy = seed(&store, FrequencyTier::Daily, 1).await[0];
    store
        .set_last_execution(healthy, Some(now - ChronoDuration::days(2)))
        .await;
    let scheduler = paged_engine(&store, &queue, 2);

    let report = scheduler
        .scan_tier_at(FrequencyTier::Daily, now)
        .await
        .unwrap();
    assert_eq!(report.enqueued, 3);
    assert!(queue.snapshot().iter().any(|m| m.watch_id() == healthy));

    settle_jobs(&store, &queue, &failing).await;
    assert!(store.get_watch(healthy).await.unwrap().unwrap().last_execution >= Some(now));

    // Failed watches stay due; the refreshed one does not
    let report = scheduler
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.due, 2);
    assert_eq!(report.enqueued, 2);
}

#[tokio::test]
async fn test_pending_leases_do_not_fill_a_page() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    let ids = seed(&store, FrequencyTier::Daily, 3).await;
    let scheduler = paged_engine(&store, &queue, 2);

    let first = scheduler
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await
        .unwrap();
    assert_eq!(first.enqueued, 3);

    // A watch whose lease lapsed comes back while the others are still pending
    let queued = queue.snapshot();
    let JobMessage::Refresh(job) = &queued[2];
    let lapsed = job.watch_id;
    assert!(store.release_lease(lapsed, job.lease_token).await.unwrap());

    let second = scheduler
        .scan_tier_at(FrequencyTier::Daily, Utc::now())
        .await
        .unwrap();
    assert_eq!(second.due, 1);
    assert_eq!(second.enqueued, 1);
    assert!(ids.contains(&lapsed));
    assert_eq!(queue.snapshot()[3].watch_id(), lapsed);
}

#[tokio::test]
async fn test_start_scans_immediately_and_stops_on_signal() {
    let store = Arc::new(InMemoryWatchStore::new());
    let queue = InMemoryQueue::new();
    seed(&store, FrequencyTier::Daily, 1).await;
    seed(&store, FrequencyTier::Weekly, 1).await;
    seed(&store, FrequencyTier::Monthly, 1).await;
    let scheduler = Arc::new(engine(&store, &queue));

    let running = Arc::clone(&scheduler);
    let handle = tokio::spawn(async move { running.start().await });

    for _ in 0..100 {
        if queue.published() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(queue.published(), 3);

    scheduler.stop().await.unwrap();
    let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(matches!(stopped, Ok(Ok(Ok(())))));
}
