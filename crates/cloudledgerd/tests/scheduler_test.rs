use cloudledger::{
    Collector, LedgerError, MemoryStore, RawObject, RawStream, Reconciler, Store, builtin,
};
use cloudledgerd::{Job, JobOutcome, RetryConfig, Scheduler, SchedulerConfig};
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SCOPE: &str = "proj-a";

/// Lists fixed objects after a delay, failing the first `failures` listings
struct ScriptedCollector {
    objects: Vec<RawObject>,
    failures: AtomicU32,
    failure: fn(String) -> LedgerError,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedCollector {
    fn listing(ids: &[&str]) -> Self {
        Self {
            objects: ids.iter().map(|id| instance(id)).collect(),
            failures: AtomicU32::new(0),
            failure: LedgerError::Transient,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, failures: u32, failure: fn(String) -> LedgerError) -> Self {
        self.failures = AtomicU32::new(failures);
        self.failure = failure;
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Collector for ScriptedCollector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch_all<'a>(&'a self, _scope: &'a str) -> RawStream<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let items: Vec<cloudledger::Result<RawObject>> = if fail {
            vec![Err((self.failure)("scripted failure".into()))]
        } else {
            self.objects.iter().cloned().map(Ok).collect()
        };

        let mut items = Some(items);
        stream::once(tokio::time::sleep(self.delay))
            .flat_map(move |_| stream::iter(items.take().unwrap_or_default()))
            .boxed()
    }
}

fn instance(id: &str) -> RawObject {
    RawObject::new(
        id,
        json!({"id": id, "name": format!("vm-{id}"), "status": "RUNNING"}),
    )
}

struct Fixture {
    store: Arc<MemoryStore>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
        }
    }

    async fn job(&self, collector: Arc<ScriptedCollector>) -> Job {
        let reconciler = Reconciler::new(
            Arc::new(builtin::instance()),
            self.store.clone(),
            collector,
        );
        reconciler.prepare().await.unwrap();
        Job::new(reconciler, SCOPE)
    }

    async fn is_live(&self, id: &str) -> bool {
        let desc = builtin::instance();
        let mut tx = self.store.begin().await.unwrap();
        let record = tx.load_with_children(&desc, id).await.unwrap();
        tx.rollback().await.unwrap();
        record.is_some()
    }
}

fn scheduler(max_attempts: u32) -> Scheduler {
    Scheduler::new(SchedulerConfig {
        interval: Duration::from_secs(10),
        run_timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            backoff_multiplier: 2.0,
        },
    })
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_with_capped_backoff() {
    let fixture = Fixture::new();
    let collector =
        Arc::new(ScriptedCollector::listing(&["1"]).failing(u32::MAX, LedgerError::Transient));
    let job = fixture.job(collector.clone()).await;

    let start = Instant::now();
    let outcome = scheduler(4).run_once(&job).await;

    match outcome {
        JobOutcome::Failed { error, attempts } => {
            assert_eq!(attempts, 4);
            assert!(matches!(error, LedgerError::Transient(_)));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(collector.calls(), 4);

    // 1s + 2s + 3s (capped)
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(6), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(6100), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_not_retried() {
    let fixture = Fixture::new();
    let collector =
        Arc::new(ScriptedCollector::listing(&["1"]).failing(u32::MAX, LedgerError::Permanent));
    let job = fixture.job(collector.clone()).await;

    let start = Instant::now();
    let outcome = scheduler(5).run_once(&job).await;

    assert_eq!(outcome.attempts(), 1);
    assert!(!outcome.is_completed());
    assert_eq!(collector.calls(), 1);
    assert!(start.elapsed() < Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failures() {
    let fixture = Fixture::new();
    let collector =
        Arc::new(ScriptedCollector::listing(&["1", "2"]).failing(2, LedgerError::Storage));
    let job = fixture.job(collector.clone()).await;

    match scheduler(3).run_once(&job).await {
        JobOutcome::Completed {
            run,
            sweep,
            attempts,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(run.created, 2);
            assert_eq!(sweep.unwrap().retired, 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(fixture.is_live("2").await);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_only_after_successful_run() {
    let fixture = Fixture::new();
    let scheduler = scheduler(2);

    let seed = fixture
        .job(Arc::new(ScriptedCollector::listing(&["1", "2"])))
        .await;
    assert!(scheduler.run_once(&seed).await.is_completed());
    // Watermarks come from the wall clock, which the paused runtime does not move
    std::thread::sleep(Duration::from_millis(2));

    // Entity 2 vanished upstream but the listing keeps failing
    let broken = fixture
        .job(Arc::new(
            ScriptedCollector::listing(&["1"]).failing(u32::MAX, LedgerError::Transient),
        ))
        .await;
    assert!(!scheduler.run_once(&broken).await.is_completed());
    assert!(fixture.is_live("2").await);

    let healthy = fixture
        .job(Arc::new(ScriptedCollector::listing(&["1"])))
        .await;
    match scheduler.run_once(&healthy).await {
        JobOutcome::Completed { sweep, .. } => assert_eq!(sweep.unwrap().retired, 1),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!fixture.is_live("2").await);
    assert!(fixture.is_live("1").await);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_as_transient() {
    let fixture = Fixture::new();
    let collector = Arc::new(ScriptedCollector::listing(&["1"]).slow(Duration::from_secs(60)));
    let job = fixture.job(collector.clone()).await;

    let start = Instant::now();
    let outcome = scheduler(2).run_once(&job).await;

    match outcome {
        JobOutcome::Failed { error, attempts } => {
            assert_eq!(attempts, 2);
            assert!(error.is_retryable());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(collector.calls(), 2);
    // 5s timeout, 1s backoff, 5s timeout
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(11), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(11100), "{elapsed:?}");
    assert!(!fixture.is_live("1").await);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_trigger_is_skipped() {
    let fixture = Fixture::new();
    let collector = Arc::new(ScriptedCollector::listing(&["1"]).slow(Duration::from_secs(3)));
    let job = fixture.job(collector.clone()).await;
    let scheduler = Arc::new(scheduler(1));

    let first = {
        let scheduler = scheduler.clone();
        let job = job.clone();
        tokio::spawn(async move { scheduler.run_once(&job).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(scheduler.run_once(&job).await, JobOutcome::Skipped));
    assert!(first.await.unwrap().is_completed());

    // Released once the first run finished
    assert!(scheduler.run_once(&job).await.is_completed());
    assert_eq!(collector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_serve_triggers_on_interval_until_cancelled() {
    let fixture = Fixture::new();
    let collector = Arc::new(ScriptedCollector::listing(&["1"]));
    let job = fixture.job(collector.clone()).await;
    let scheduler = Arc::new(scheduler(1));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(scheduler.clone().serve(vec![job], cancel.clone()));

    // Ticks at 0s, 10s and 20s
    tokio::time::sleep(Duration::from_secs(25)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(collector.calls(), 3);
    assert!(fixture.is_live("1").await);
}

#[tokio::test(start_paused = true)]
async fn test_serve_abandons_in_flight_run_on_shutdown() {
    let fixture = Fixture::new();
    // Longer than the interval and shorter than the run timeout
    let collector = Arc::new(ScriptedCollector::listing(&["1"]).slow(Duration::from_secs(4)));
    let job = fixture.job(collector.clone()).await;
    let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
        interval: Duration::from_secs(1),
        run_timeout: Duration::from_secs(30),
        retry: RetryConfig::default(),
    }));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(scheduler.clone().serve(vec![job.clone()], cancel.clone()));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    cancel.cancel();
    handle.await.unwrap();

    // Ticks at 1s and 2s found the first run in flight
    assert_eq!(collector.calls(), 1);
    assert!(!fixture.is_live("1").await);

    // The abandoned run released its slot
    assert!(scheduler.run_once(&job).await.is_completed());
}
