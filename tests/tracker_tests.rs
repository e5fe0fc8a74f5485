//! End-to-end tracker tests.
//!
//! A scripted worker stands in for the remote service; the tokio clock is
//! paused so cycle timing is exact.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use jobwatch::clock::{Clock, TokioClock};
use jobwatch::events::PollEvent;
use jobwatch::models::{CheckOutcome, JobStatus, NewJob};
use jobwatch::storage::{BlobStore, FsBlobStore, JobStore, MemoryBlobStore, JOBS_NAMESPACE};
use jobwatch::tracker::{JobTracker, StatusClient, JOB_STATUS_SUBSCRIPTION};

const INTERVAL: Duration = Duration::from_millis(5000);

/// Answers from a queue, then repeats `fallback`.
struct ScriptedWorker {
    script: Mutex<VecDeque<CheckOutcome>>,
    fallback: Mutex<CheckOutcome>,
    latency: Duration,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedWorker {
    fn new(script: Vec<CheckOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Mutex::new(CheckOutcome::StillPending),
            latency: Duration::ZERO,
            offline: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn set_fallback(&self, outcome: CheckOutcome) {
        *self.fallback.lock().unwrap() = outcome;
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusClient for ScriptedWorker {
    async fn check_status(&self, _job_id: &str) -> anyhow::Result<CheckOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.lock().unwrap().clone()))
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap()
}

fn ms(n: i64) -> chrono::Duration {
    chrono::Duration::milliseconds(n)
}

struct Harness {
    store: Arc<JobStore>,
    blobs: Arc<MemoryBlobStore>,
    worker: Arc<ScriptedWorker>,
    tracker: Arc<JobTracker>,
}

/// Memory blobs whose writes take `delay` to land.
struct SlowBlobStore {
    inner: Arc<MemoryBlobStore>,
    delay: Duration,
}

#[async_trait]
impl BlobStore for SlowBlobStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.set(key, value).await
    }
}

async fn harness(worker: ScriptedWorker, deadline: Option<chrono::Duration>) -> Harness {
    assemble(worker, deadline, Duration::ZERO).await
}

async fn assemble(
    worker: ScriptedWorker,
    deadline: Option<chrono::Duration>,
    write_delay: Duration,
) -> Harness {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new(t0()));
    let blobs = Arc::new(MemoryBlobStore::new());
    let backing: Arc<dyn BlobStore> = if write_delay.is_zero() {
        blobs.clone()
    } else {
        Arc::new(SlowBlobStore {
            inner: blobs.clone(),
            delay: write_delay,
        })
    };
    let store = Arc::new(
        JobStore::open(backing, clock.clone(), 64)
            .await
            .expect("open store"),
    );
    let worker = Arc::new(worker);
    let tracker = Arc::new(
        JobTracker::new(store.clone(), worker.clone(), clock, INTERVAL, 64)
            .with_deadline(deadline),
    );
    Harness {
        store,
        blobs,
        worker,
        tracker,
    }
}

fn spawn_run(
    tracker: &Arc<JobTracker>,
) -> (CancellationToken, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let token = CancellationToken::new();
    let tracker = Arc::clone(tracker);
    let run_token = token.clone();
    let handle = tokio::spawn(async move { tracker.run(run_token).await });
    (token, handle)
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_pending_pending_completed() {
    let h = harness(
        ScriptedWorker::new(vec![
            CheckOutcome::StillPending,
            CheckOutcome::StillPending,
            CheckOutcome::Completed {
                result_id: "res-42".to_string(),
            },
        ]),
        None,
    )
    .await;

    let _ = h.tracker.submit(NewJob::new("cid-1")).await.expect("submit");
    let (token, handle) = spawn_run(&h.tracker);

    tokio::time::sleep(Duration::from_millis(16_000)).await;

    let job = h.store.get_job("cid-1").await.expect("job present");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_id.as_deref(), Some("res-42"));
    assert_eq!(job.requested_at, Some(t0()));
    assert_eq!(job.last_checked_at, t0() + ms(15_000));
    assert_eq!(h.worker.calls(), 3);
    assert!(
        !h.tracker.scheduler().is_active(JOB_STATUS_SUBSCRIPTION),
        "No pending jobs left, polling should stop"
    );

    let raw = h.blobs.raw(JOBS_NAMESPACE).expect("persisted");
    let persisted: serde_json::Value = serde_json::from_slice(&raw).expect("json");
    assert_eq!(persisted[0]["jobId"], "cid-1");
    assert_eq!(persisted[0]["status"], "completed");
    assert_eq!(persisted[0]["resultId"], "res-42");

    token.cancel();
    handle.await.expect("join").expect("run");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_discards_in_flight_result() {
    let h = harness(
        ScriptedWorker::new(vec![CheckOutcome::Completed {
            result_id: "late".to_string(),
        }])
        .with_latency(Duration::from_millis(2000)),
        None,
    )
    .await;
    let mut events = h.tracker.scheduler().subscribe_events();

    let _ = h.tracker.submit(NewJob::new("cid-1")).await.expect("submit");
    assert!(h.tracker.refresh().await);

    // The only check starts at 5000 and resolves at 7000.
    tokio::time::sleep(Duration::from_millis(6000)).await;
    assert_eq!(h.worker.calls(), 1);
    assert!(h.tracker.scheduler().cancel(JOB_STATUS_SUBSCRIPTION));

    tokio::time::sleep(Duration::from_millis(4000)).await;

    let job = h.store.get_job("cid-1").await.expect("job present");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.result_id.is_none());
    assert_eq!(job.last_checked_at, t0());
    assert_eq!(h.worker.calls(), 1);

    let mut saw_discard = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PollEvent::StaleResultDiscarded { .. }) {
            saw_discard = true;
        }
    }
    assert!(saw_discard, "Late result should be reported as discarded");
}

/// Two pending jobs whose every check completes, on a store whose writes
/// take 100ms. Polling starts at the returned instant.
async fn slow_store_with_two_jobs() -> (Harness, Instant) {
    let worker = ScriptedWorker::new(vec![]);
    worker.set_fallback(CheckOutcome::Completed {
        result_id: "res".to_string(),
    });
    let h = assemble(worker, None, Duration::from_millis(100)).await;
    for id in ["cid-a", "cid-b"] {
        let _ = h.tracker.submit(NewJob::new(id)).await.expect("submit");
    }
    assert!(h.tracker.refresh().await);
    (h, Instant::now())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_apply_waits_for_store_writes_nothing() {
    let (h, started) = slow_store_with_two_jobs().await;

    // A competing add holds the store lock from 4950 to 5050, so the apply
    // for the check at 5000 is still queued when the cancel lands at 5020.
    let store = Arc::clone(&h.store);
    let competing = tokio::spawn(async move {
        tokio::time::sleep_until(started + Duration::from_millis(4950)).await;
        let _ = store.add_job(NewJob::new("cid-c")).await.expect("add");
    });

    tokio::time::sleep_until(started + Duration::from_millis(5020)).await;
    assert_eq!(h.worker.calls(), 2);
    let writes_before_cancel = h.blobs.write_count();
    assert!(h.tracker.scheduler().cancel(JOB_STATUS_SUBSCRIPTION));

    competing.await.expect("join");
    tokio::time::sleep(Duration::from_millis(1000)).await;

    for id in ["cid-a", "cid-b"] {
        let job = h.store.get_job(id).await.expect("job");
        assert_eq!(job.status, JobStatus::Pending, "{} written after cancel", id);
        assert!(job.result_id.is_none());
    }
    assert_eq!(
        h.blobs.write_count(),
        writes_before_cancel + 1,
        "Only the competing add reaches storage"
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_batch_persist_keeps_batch_whole() {
    let (h, started) = slow_store_with_two_jobs().await;
    let writes_before = h.blobs.write_count();

    // The apply for the check at 5000 persists until 5100.
    tokio::time::sleep_until(started + Duration::from_millis(5020)).await;
    assert!(h.tracker.scheduler().cancel(JOB_STATUS_SUBSCRIPTION));
    tokio::time::sleep(Duration::from_millis(1000)).await;

    for id in ["cid-a", "cid-b"] {
        let job = h.store.get_job(id).await.expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_id.as_deref(), Some("res"));
    }
    assert_eq!(
        h.blobs.write_count(),
        writes_before + 1,
        "Both outcomes share one persist"
    );
    let raw = h.blobs.raw(JOBS_NAMESPACE).expect("persisted");
    let persisted: serde_json::Value = serde_json::from_slice(&raw).expect("json");
    assert_eq!(persisted[0]["status"], "completed");
    assert_eq!(persisted[1]["status"], "completed");
    assert_eq!(h.worker.calls(), 2, "No check after cancel");
}

#[tokio::test(start_paused = true)]
async fn test_overdue_job_becomes_reassignable_and_can_be_resubmitted() {
    let h = harness(ScriptedWorker::new(vec![]), Some(chrono::Duration::seconds(12))).await;

    let _ = h.tracker.submit(NewJob::new("cid-1")).await.expect("submit");
    let (token, handle) = spawn_run(&h.tracker);

    // Checks at 5000 and 10000 are within the deadline; 15000 is past it.
    tokio::time::sleep(Duration::from_millis(16_000)).await;
    let job = h.store.get_job("cid-1").await.expect("job");
    assert_eq!(job.status, JobStatus::Reassignable);
    assert_eq!(job.last_checked_at, t0() + ms(15_000));
    assert!(!h.tracker.scheduler().is_active(JOB_STATUS_SUBSCRIPTION));

    h.worker.set_fallback(CheckOutcome::Completed {
        result_id: "res-7".to_string(),
    });
    let _ = h
        .tracker
        .resubmit("cid-1", Some("http://worker-b:8080".to_string()))
        .await
        .expect("resubmit");

    // Run loop restarts polling at 16000; first check one interval later.
    tokio::time::sleep(Duration::from_millis(6000)).await;
    let job = h.store.get_job("cid-1").await.expect("job");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_id.as_deref(), Some("res-7"));
    assert_eq!(job.worker_address.as_deref(), Some("http://worker-b:8080"));
    assert_eq!(job.requested_at, Some(t0() + ms(16_000)));
    assert_eq!(job.last_checked_at, t0() + ms(21_000));

    token.cancel();
    handle.await.expect("join").expect("run");
}

#[tokio::test(start_paused = true)]
async fn test_worker_outage_keeps_jobs_pending_and_polling() {
    let h = harness(ScriptedWorker::new(vec![]), None).await;
    h.worker.set_offline(true);
    let mut events = h.tracker.scheduler().subscribe_events();

    let _ = h.tracker.submit(NewJob::new("cid-1")).await.expect("submit");
    let (token, handle) = spawn_run(&h.tracker);

    tokio::time::sleep(Duration::from_millis(11_000)).await;
    assert_eq!(h.worker.calls(), 2);
    let job = h.store.get_job("cid-1").await.expect("job");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.last_checked_at, t0());

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PollEvent::CheckFailed { .. }) {
            failures += 1;
        }
    }
    assert_eq!(failures, 2);

    h.worker.set_offline(false);
    tokio::time::sleep(Duration::from_millis(5000)).await;
    let job = h.store.get_job("cid-1").await.expect("job");
    assert_eq!(job.last_checked_at, t0() + ms(15_000));
    assert!(h.tracker.scheduler().is_active(JOB_STATUS_SUBSCRIPTION));

    token.cancel();
    handle.await.expect("join").expect("run");
    assert!(!h.tracker.scheduler().is_active(JOB_STATUS_SUBSCRIPTION));
}

#[tokio::test(start_paused = true)]
async fn test_new_submission_joins_running_poll() {
    let h = harness(ScriptedWorker::new(vec![]), None).await;

    let _ = h.tracker.submit(NewJob::new("cid-1")).await.expect("submit");
    let (token, handle) = spawn_run(&h.tracker);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let first_generation = h
        .tracker
        .scheduler()
        .generation(JOB_STATUS_SUBSCRIPTION)
        .expect("running");

    let _ = h.tracker.submit(NewJob::new("cid-2")).await.expect("submit");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let deps = h
        .tracker
        .scheduler()
        .dependencies(JOB_STATUS_SUBSCRIPTION)
        .expect("running");
    assert_eq!(deps.len(), 2);
    assert!(
        h.tracker.scheduler().generation(JOB_STATUS_SUBSCRIPTION) > Some(first_generation),
        "Changed dependency set restarts the loop"
    );

    token.cancel();
    handle.await.expect("join").expect("run");
}

#[tokio::test]
async fn test_jobs_survive_restart_on_disk() {
    let tmp = TempDir::new().expect("temp dir");
    let clock: Arc<dyn Clock> = Arc::new(jobwatch::clock::SystemClock);

    {
        let blobs = Arc::new(FsBlobStore::new(tmp.path().to_path_buf()).await.expect("fs"));
        let store = Arc::new(JobStore::open(blobs, clock.clone(), 16).await.expect("open"));
        let worker = Arc::new(ScriptedWorker::new(vec![]));
        let tracker = JobTracker::new(store, worker, clock.clone(), INTERVAL, 16);
        let report = tracker.submit(NewJob::new("cid-1")).await.expect("submit");
        assert!(report.persist_error.is_none());
    }

    let blobs = Arc::new(FsBlobStore::new(tmp.path().to_path_buf()).await.expect("fs"));
    let store = JobStore::open(blobs, clock, 16).await.expect("reopen");
    let pending = store.pending_ids().await;
    assert!(pending.contains("cid-1"));
}
