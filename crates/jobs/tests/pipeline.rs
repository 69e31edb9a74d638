use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use scanrelay_core::{
    config::{Config, RedisConfig, WorkerConfig},
    models::{
        CallbackPayload, Conclusion, Finding, JobContext, JobId, Locator, QueueMessage, ScanResult,
        ScannerKind, ScopeUnit, Severity, TriggerEvent,
    },
};
use scanrelay_github::{
    RepoRef, Reporter,
    checkout::{Checkout, SourceFetcher},
    report::{CheckRunUpdate, NewCheckRun},
};
use scanrelay_jobs::{Dispatcher, Notifier, Outcome, Worker, WorkerContext, run_supervised};
use scanrelay_scanners::Scanner;
use scanrelay_store::{
    ContextStore, MemoryBroker, StoreError, StoreResult, StreamEntry, StreamQueue,
};

const CALLBACK_URL: &str = "http://dispatcher/callback";

struct FakeScanner {
    kind: ScannerKind,
    result: ScanResult,
    delay: Duration,
    panic_once: AtomicBool,
    panic_always: bool,
}

impl FakeScanner {
    fn new(kind: ScannerKind, result: ScanResult) -> Self {
        Self {
            kind,
            result,
            delay: Duration::ZERO,
            panic_once: AtomicBool::new(false),
            panic_always: false,
        }
    }
}

#[async_trait]
impl Scanner for FakeScanner {
    fn kind(&self) -> ScannerKind { self.kind }

    fn scope_unit(&self) -> ScopeUnit { self.result.scope_unit }

    async fn check_installed(&self) -> Result<String> { Ok("fake 1.0".to_string()) }

    async fn run(&self, source: &Path, _project_label: &str) -> ScanResult {
        assert!(source.is_dir());
        tokio::time::sleep(self.delay).await;
        if self.panic_always || self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("scanner crashed");
        }
        self.result.clone()
    }
}

#[derive(Default)]
struct TempSource {
    fail: bool,
    fetched: Mutex<Vec<JobContext>>,
}

#[async_trait]
impl SourceFetcher for TempSource {
    async fn fetch(&self, context: &JobContext) -> Result<Checkout> {
        self.fetched.lock().unwrap().push(context.clone());
        if self.fail {
            bail!("Git clone failed: remote branch main not found");
        }
        Ok(Checkout::new(tempfile::tempdir()?))
    }
}

#[derive(Debug, Clone)]
enum Call {
    Comment { repo: RepoRef, pull_request: u64, body: String },
    CheckRun { id: u64, head_sha: String, conclusion: Conclusion, annotations: usize },
    Update { id: u64, annotations: usize },
}

#[derive(Default)]
struct RecordingReporter {
    calls: Mutex<Vec<Call>>,
    next_id: AtomicU64,
    /// Record every call, then fail it.
    failing: bool,
}

impl RecordingReporter {
    fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

    fn comments(&self) -> Vec<(RepoRef, u64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Comment { repo, pull_request, body } => Some((repo, pull_request, body)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn post_comment(&self, repo: &RepoRef, pull_request: u64, body: &str) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Comment {
            repo: repo.clone(),
            pull_request,
            body: body.to_string(),
        });
        if self.failing {
            bail!("GitHub API error: 502 Bad Gateway");
        }
        Ok(())
    }

    async fn create_check_run(&self, _repo: &RepoRef, check_run: &NewCheckRun) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.lock().unwrap().push(Call::CheckRun {
            id,
            head_sha: check_run.head_sha.clone(),
            conclusion: check_run.conclusion,
            annotations: check_run.output.annotations.len(),
        });
        if self.failing {
            bail!("GitHub API error: 502 Bad Gateway");
        }
        Ok(id)
    }

    async fn update_check_run(
        &self,
        _repo: &RepoRef,
        check_run_id: u64,
        update: &CheckRunUpdate,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Update { id: check_run_id, annotations: update.output.annotations.len() });
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, CallbackPayload)>>,
    failing: bool,
}

impl RecordingNotifier {
    fn messages(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| STANDARD.decode(&payload.msg_base64).unwrap())
            .map(|message| String::from_utf8(message).unwrap())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<()> {
        self.sent.lock().unwrap().push((url.to_string(), payload.clone()));
        if self.failing {
            bail!("Callback returned 503 Service Unavailable");
        }
        Ok(())
    }
}

fn config() -> Arc<Config> { config_with(WorkerConfig { block_ms: 50, ..Default::default() }) }

fn config_with(worker: WorkerConfig) -> Arc<Config> {
    Arc::new(Config {
        server: Default::default(),
        redis: RedisConfig { url: "redis://unused".to_string() },
        github: Default::default(),
        dispatch: Default::default(),
        worker,
        scanners: Default::default(),
        callbacks: Default::default(),
    })
}

/// Queue whose reads fail with a connection error a fixed number of times.
struct FlakyQueue {
    inner: Arc<MemoryBroker>,
    failures: AtomicU32,
}

impl FlakyQueue {
    fn fail_next(&self) -> StoreResult<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("Connection refused (os error 111)".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamQueue for FlakyQueue {
    async fn publish(&self, stream: &str, message: &QueueMessage) -> StoreResult<String> {
        self.inner.publish(stream, message).await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        self.inner.ensure_group(stream, group).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        self.fail_next()?;
        self.inner.claim(stream, group, consumer, block, count).await
    }

    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        self.fail_next()?;
        self.inner.reclaim(stream, group, consumer, min_idle, count).await
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StoreResult<()> {
        self.inner.ack(stream, group, entry_id).await
    }

    async fn delete(&self, stream: &str, entry_id: &str) -> StoreResult<()> {
        self.inner.delete(stream, entry_id).await
    }
}

fn event() -> TriggerEvent {
    TriggerEvent {
        repo_owner: "acme".to_string(),
        repo_name: "svc".to_string(),
        branch: "main".to_string(),
        pull_request_id: 7,
        commit_sha: "abc123".to_string(),
        installation_id: Some(42),
    }
}

fn findings(severity: Severity, n: usize) -> Vec<Finding> {
    (0..n)
        .map(|i| Finding {
            severity,
            title: format!("Issue {i}"),
            locator: Locator::File { path: format!("infra/{i}.tf"), line: Some(1) },
            description: "Something is misconfigured".to_string(),
            external_id: None,
        })
        .collect()
}

struct Harness {
    broker: Arc<MemoryBroker>,
    source: Arc<TempSource>,
    reporter: Arc<RecordingReporter>,
    notifier: Arc<RecordingNotifier>,
    config: Arc<Config>,
}

impl Harness {
    fn new() -> Self { Self::with_source(TempSource::default()) }

    fn with_source(source: TempSource) -> Self {
        Self {
            broker: Arc::new(MemoryBroker::new()),
            source: Arc::new(source),
            reporter: Arc::new(RecordingReporter::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            config: config(),
        }
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.broker.clone(), self.broker.clone(), self.config.dispatch.clone())
    }

    async fn worker(&self, scanner: FakeScanner) -> Worker {
        self.worker_with_queue(scanner, self.broker.clone()).await
    }

    async fn worker_with_queue(&self, scanner: FakeScanner, queue: Arc<dyn StreamQueue>) -> Worker {
        let worker = Worker::new(WorkerContext {
            config: self.config.clone(),
            contexts: self.broker.clone(),
            queue,
            scanner: Arc::new(scanner),
            source: self.source.clone(),
            reporter: self.reporter.clone(),
            notifier: self.notifier.clone(),
        });
        worker.prepare().await.unwrap();
        worker
    }
}

fn clean(kind: ScannerKind) -> FakeScanner {
    let unit = if kind == ScannerKind::Kics { ScopeUnit::Files } else { ScopeUnit::Components };
    FakeScanner::new(kind, ScanResult::from_findings(vec![], 10, unit, 1.0))
}

#[tokio::test]
async fn test_end_to_end_dispatch_and_scan() {
    let harness = Harness::new();
    let receipt = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    assert_eq!(receipt.enqueued.len(), 2);
    assert_eq!(harness.broker.stream_len("worker-kics"), 1);
    assert_eq!(harness.broker.stream_len("worker-blackduck"), 1);

    for &kind in ScannerKind::variants() {
        let worker = harness.worker(clean(kind)).await;
        let outcome = worker.process_one().await.unwrap();
        assert_eq!(outcome, Outcome::Completed { id: receipt.id, conclusion: Conclusion::Success });
        assert_eq!(harness.broker.stream_len(worker.stream()), 0);
        assert_eq!(harness.broker.pending_len(worker.stream(), "workers"), 0);
    }

    let comments = harness.reporter.comments();
    assert_eq!(comments.len(), 2);
    for (repo, pull_request, body) in &comments {
        assert_eq!(repo, &RepoRef::new("acme", "svc"));
        assert_eq!(*pull_request, 7);
        assert!(body.contains("| Severity | Count |"));
        assert!(body.contains("No issues found"));
    }
    let check_runs = harness
        .reporter
        .calls()
        .into_iter()
        .filter(|call| {
            matches!(
                call,
                Call::CheckRun { head_sha, conclusion: Conclusion::Success, .. }
                    if head_sha == "abc123"
            )
        })
        .count();
    assert_eq!(check_runs, 2);

    let sent = harness.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(
        sent.iter().all(|(url, payload)| url == CALLBACK_URL && payload.id == receipt.id.to_string())
    );
    let apps = sent.iter().map(|(_, payload)| payload.app_name.as_str()).collect::<Vec<_>>();
    assert_eq!(apps, vec!["kics-worker", "blackduck-worker"]);
    assert_eq!(
        harness.notifier.messages()[0],
        "KICS scan completed: 0 issues found (CRITICAL=0, HIGH=0, MEDIUM=0)"
    );
}

#[tokio::test]
async fn test_context_resolves_to_dispatched_fields() {
    let harness = Harness::new();
    let receipt = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let worker = harness.worker(clean(ScannerKind::Kics)).await;
    worker.process_one().await.unwrap();

    let fetched = harness.source.fetched.lock().unwrap().clone();
    assert_eq!(fetched, vec![JobContext::from_event(receipt.id, event(), CALLBACK_URL)]);
    assert_eq!(fetched[0].installation_id, Some(42));
}

#[tokio::test]
async fn test_missing_context_is_discarded() {
    let harness = Harness::new();
    let id = JobId::new();
    let message = QueueMessage { id, callback_url: CALLBACK_URL.to_string() };
    harness.broker.publish("worker-kics", &message).await.unwrap();
    let worker = harness.worker(clean(ScannerKind::Kics)).await;

    let outcome = worker.process_one().await.unwrap();
    assert!(matches!(outcome, Outcome::Discarded { .. }));
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
    assert_eq!(harness.broker.pending_len("worker-kics", "workers"), 0);
    assert!(harness.reporter.calls().is_empty());
    assert!(harness.source.fetched.lock().unwrap().is_empty());
    assert_eq!(harness.notifier.messages(), vec![format!(
        "Scan failed: job context {id} not found"
    )]);
}

#[tokio::test]
async fn test_expired_context_is_discarded() {
    let harness = Harness::new();
    let receipt = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    harness.broker.expire(&receipt.id);
    let worker = harness.worker(clean(ScannerKind::Blackduck)).await;
    let outcome = worker.process_one().await.unwrap();
    assert!(matches!(outcome, Outcome::Discarded { .. }));
    assert_eq!(harness.broker.stream_len("worker-blackduck"), 0);
}

#[tokio::test]
async fn test_corrupt_message_is_discarded() {
    let harness = Harness::new();
    harness.broker.publish_raw("worker-kics", Some("{not json".to_string()));
    harness.broker.publish_raw("worker-kics", None);
    let worker = harness.worker(clean(ScannerKind::Kics)).await;

    for _ in 0..2 {
        let outcome = worker.process_one().await.unwrap();
        assert!(matches!(outcome, Outcome::Discarded { .. }));
    }
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
    assert!(harness.notifier.messages().is_empty());
    assert_eq!(worker.process_one().await.unwrap(), Outcome::Idle);
}

#[tokio::test]
async fn test_failed_scan_is_still_reported() {
    let harness = Harness::new();
    let receipt = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let scanner = FakeScanner::new(
        ScannerKind::Kics,
        ScanResult::failed(ScopeUnit::Files, "No results file generated"),
    );
    let worker = harness.worker(scanner).await;

    let outcome = worker.process_one().await.unwrap();
    assert_eq!(outcome, Outcome::Completed { id: receipt.id, conclusion: Conclusion::Failure });
    let comments = harness.reporter.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].2.contains("No results file generated"));
    assert_eq!(harness.notifier.messages(), vec!["Scan failed: No results file generated"]);
}

#[tokio::test]
async fn test_checkout_failure_is_reported() {
    let harness = Harness::with_source(TempSource { fail: true, ..Default::default() });
    harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let worker = harness.worker(clean(ScannerKind::Kics)).await;

    let outcome = worker.process_one().await.unwrap();
    assert!(matches!(outcome, Outcome::Completed { conclusion: Conclusion::Failure, .. }));
    assert_eq!(harness.reporter.comments().len(), 1);
    assert_eq!(harness.notifier.messages(), vec![
        "Scan failed: Git clone failed: remote branch main not found"
    ]);
}

#[tokio::test]
async fn test_annotations_are_batched() {
    let harness = Harness::new();
    harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let result =
        ScanResult::from_findings(findings(Severity::Medium, 120), 40, ScopeUnit::Files, 3.0);
    let worker = harness.worker(FakeScanner::new(ScannerKind::Kics, result)).await;

    worker.process_one().await.unwrap();
    let batches = harness
        .reporter
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::CheckRun { id, annotations, .. } => Some((id, annotations)),
            Call::Update { id, annotations } => Some((id, annotations)),
            Call::Comment { .. } => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(batches, vec![(1, 50), (1, 50), (1, 20)]);
}

#[tokio::test]
async fn test_reporting_skips_missing_pull_request_and_sha() {
    let harness = Harness::new();
    let event = TriggerEvent { pull_request_id: 0, commit_sha: String::new(), ..event() };
    harness.dispatcher().submit(event, CALLBACK_URL).await.unwrap();
    let worker = harness.worker(clean(ScannerKind::Kics)).await;

    let outcome = worker.process_one().await.unwrap();
    assert!(matches!(outcome, Outcome::Completed { .. }));
    assert!(harness.reporter.calls().is_empty());
    assert_eq!(harness.notifier.messages().len(), 1);
}

#[tokio::test]
async fn test_duplicate_delivery_yields_independent_reports() {
    let harness = Harness::new();
    let receipt = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let message = QueueMessage { id: receipt.id, callback_url: CALLBACK_URL.to_string() };
    harness.broker.publish("worker-kics", &message).await.unwrap();
    let result = ScanResult::from_findings(findings(Severity::High, 2), 5, ScopeUnit::Files, 1.0);
    let worker = harness.worker(FakeScanner::new(ScannerKind::Kics, result)).await;

    let first = worker.process_one().await.unwrap();
    let second = worker.process_one().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, Outcome::Completed { id: receipt.id, conclusion: Conclusion::Neutral });
    let comments = harness.reporter.comments();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0], comments[1]);
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_entry_is_reclaimed_after_idle() {
    let harness = Harness::new();
    let receipt = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let worker = harness.worker(clean(ScannerKind::Kics)).await;

    // Another worker claimed the entry and crashed before acknowledging it.
    let claimed = harness
        .broker
        .claim("worker-kics", "workers", "kics-worker-crashed", Duration::from_millis(10), 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(worker.process_one().await.unwrap(), Outcome::Idle);
    assert_eq!(harness.broker.pending_len("worker-kics", "workers"), 1);

    tokio::time::advance(Duration::from_secs(3601)).await;
    let outcome = worker.process_one().await.unwrap();
    assert_eq!(outcome, Outcome::Completed { id: receipt.id, conclusion: Conclusion::Success });
    assert_eq!(harness.broker.pending_len("worker-kics", "workers"), 0);
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_workers_never_share_an_entry() {
    let harness = Harness::new();
    let receipt = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let slow = || FakeScanner { delay: Duration::from_millis(300), ..clean(ScannerKind::Kics) };
    let a = harness.worker(slow()).await;
    let b = harness.worker(slow()).await;
    assert_ne!(a.consumer(), b.consumer());
    assert!(a.consumer().starts_with("kics-worker-"));

    let (first, second) = tokio::join!(a.process_one(), b.process_one());
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.retain(|outcome| *outcome != Outcome::Idle);
    assert_eq!(outcomes, vec![Outcome::Completed {
        id: receipt.id,
        conclusion: Conclusion::Success
    }]);
    assert_eq!(b.process_one().await.unwrap(), Outcome::Idle);
    assert_eq!(harness.reporter.comments().len(), 1);
    assert_eq!(harness.notifier.messages().len(), 1);
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
}

#[tokio::test]
async fn test_reporter_failures_do_not_block_callback_or_ack() {
    let harness = Harness {
        reporter: Arc::new(RecordingReporter { failing: true, ..Default::default() }),
        ..Harness::new()
    };
    let receipt = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let result = ScanResult::from_findings(findings(Severity::High, 120), 5, ScopeUnit::Files, 1.0);
    let worker = harness.worker(FakeScanner::new(ScannerKind::Kics, result)).await;

    let outcome = worker.process_one().await.unwrap();
    assert_eq!(outcome, Outcome::Completed { id: receipt.id, conclusion: Conclusion::Neutral });
    // Both calls were attempted; no annotation updates follow a failed check-run creation.
    let calls = harness.reporter.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[0], Call::Comment { .. }));
    assert!(matches!(calls[1], Call::CheckRun { .. }));
    assert_eq!(harness.notifier.messages(), vec![
        "KICS scan completed: 120 issues found (CRITICAL=0, HIGH=120, MEDIUM=0)"
    ]);
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
    assert_eq!(harness.broker.pending_len("worker-kics", "workers"), 0);
}

#[tokio::test]
async fn test_callback_failure_still_acknowledges() {
    let harness = Harness {
        notifier: Arc::new(RecordingNotifier { failing: true, ..Default::default() }),
        ..Harness::new()
    };
    harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let worker = harness.worker(clean(ScannerKind::Kics)).await;

    let outcome = worker.process_one().await.unwrap();
    assert!(matches!(outcome, Outcome::Completed { .. }));
    assert_eq!(harness.notifier.messages().len(), 1);
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
    assert_eq!(harness.broker.pending_len("worker-kics", "workers"), 0);
}

#[tokio::test]
async fn test_supervised_once_exits_after_one_job() {
    let harness = Harness::new();
    harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let worker = Arc::new(harness.worker(clean(ScannerKind::Kics)).await);

    run_supervised(worker, Duration::from_secs(1), true, std::future::pending()).await.unwrap();
    assert_eq!(harness.broker.stream_len("worker-kics"), 1);
    assert_eq!(harness.reporter.comments().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_panic_is_contained_and_entry_stays_pending() {
    let harness = Harness::new();
    harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let scanner = clean(ScannerKind::Kics);
    scanner.panic_once.store(true, Ordering::SeqCst);
    let worker = Arc::new(harness.worker(scanner).await);

    let result =
        run_supervised(worker.clone(), Duration::from_secs(1), true, std::future::pending()).await;
    assert!(result.is_err());
    assert_eq!(harness.broker.pending_len("worker-kics", "workers"), 1);
    assert_eq!(worker.process_one().await.unwrap(), Outcome::Idle);

    // Once idle long enough the entry is taken over again.
    tokio::time::advance(Duration::from_secs(3601)).await;
    let outcome = worker.process_one().await.unwrap();
    assert!(matches!(outcome, Outcome::Completed { conclusion: Conclusion::Success, .. }));
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_panics_give_up_after_max_deliveries() {
    let harness = Harness {
        config: config_with(WorkerConfig {
            block_ms: 50,
            reclaim_idle_secs: 0,
            max_deliveries: 2,
            ..Default::default()
        }),
        ..Harness::new()
    };
    let first = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let second = harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let scanner = FakeScanner { panic_always: true, ..clean(ScannerKind::Kics) };
    let worker = Arc::new(harness.worker(scanner).await);

    let shutdown = tokio::time::sleep(Duration::from_secs(30));
    run_supervised(worker, Duration::from_secs(1), false, shutdown).await.unwrap();

    let fetched = harness
        .source
        .fetched
        .lock()
        .unwrap()
        .iter()
        .map(|context| context.id)
        .collect::<Vec<_>>();
    assert_eq!(fetched, vec![first.id, first.id, second.id, second.id]);
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
    assert_eq!(harness.broker.pending_len("worker-kics", "workers"), 0);
    assert_eq!(harness.notifier.messages(), vec![
        "Scan failed: gave up after 2 deliveries",
        "Scan failed: gave up after 2 deliveries"
    ]);
    assert!(harness.reporter.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_retries_broker_errors() {
    let harness = Harness::new();
    harness.dispatcher().submit(event(), CALLBACK_URL).await.unwrap();
    let queue = Arc::new(FlakyQueue { inner: harness.broker.clone(), failures: AtomicU32::new(4) });
    let worker =
        Arc::new(harness.worker_with_queue(clean(ScannerKind::Kics), queue.clone()).await);

    let started = tokio::time::Instant::now();
    run_supervised(worker, Duration::from_secs(2), true, std::future::pending()).await.unwrap();
    // 1s + 2s + 2s + 2s of backoff before the fifth attempt succeeds.
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(queue.failures.load(Ordering::SeqCst), 0);
    assert_eq!(harness.reporter.comments().len(), 1);
    assert_eq!(harness.broker.stream_len("worker-kics"), 0);
}

#[tokio::test]
async fn test_supervisor_stops_on_shutdown() {
    let harness = Harness::new();
    let worker = Arc::new(harness.worker(clean(ScannerKind::Kics)).await);
    let shutdown = tokio::time::sleep(Duration::from_millis(120));
    run_supervised(worker, Duration::from_secs(1), false, shutdown).await.unwrap();
    assert!(harness.reporter.calls().is_empty());
}

#[tokio::test]
async fn test_context_store_round_trip() {
    let broker = MemoryBroker::new();
    let context = JobContext::from_event(JobId::new(), event(), CALLBACK_URL);
    broker.put(&context, Duration::from_secs(60)).await.unwrap();
    assert_eq!(broker.get(&context.id).await.unwrap(), Some(context));
}
