//! Orchestrator behaviour against scripted collaborators and in-memory history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use patchline::history::{History, HistoryError, HistoryStore, MemoryHistory, RUN_HISTORY_CAP};
use patchline::pipeline::{
    Collaborators, Diagnostic, FailureReporter, Orchestrator, PipelineError, PublishReceipt,
    PublishedAsset, Publisher, ReleaseRecord, RetryPolicy, RunRecord, RunStatus, Settings, Stage,
    StageExecutor, StageOutcome, StageStatus, TriggerKind, WorkItem,
};

/// Ordered log of every collaborator call, shared across doubles.
type Events = Arc<Mutex<Vec<String>>>;

fn push(events: &Events, event: String) {
    events.lock().unwrap().push(event);
}

/// Per-item scripted stage. Unscripted calls succeed.
struct ScriptedStage {
    stage: Stage,
    script: Mutex<HashMap<String, VecDeque<StageStatus>>>,
    delay: HashMap<String, Duration>,
    events: Events,
}

impl ScriptedStage {
    fn new(stage: Stage, events: Events) -> Self {
        Self {
            stage,
            script: Mutex::new(HashMap::new()),
            delay: HashMap::new(),
            events,
        }
    }

    fn script(self, item: &str, statuses: Vec<StageStatus>) -> Self {
        self.script.lock().unwrap().insert(item.to_string(), statuses.into());
        self
    }

    fn slow(mut self, item: &str, delay: Duration) -> Self {
        self.delay.insert(item.to_string(), delay);
        self
    }

    fn calls(&self, item: &str) -> usize {
        let prefix = format!("{}:{}", self.stage, item);
        self.events.lock().unwrap().iter().filter(|e| **e == prefix).count()
    }
}

#[async_trait::async_trait]
impl StageExecutor for ScriptedStage {
    async fn execute(&self, item: &WorkItem) -> StageOutcome {
        if let Some(delay) = self.delay.get(&item.name) {
            tokio::time::sleep(*delay).await;
        }
        push(&self.events, format!("{}:{}", self.stage, item.name));
        let status = self
            .script
            .lock()
            .unwrap()
            .get_mut(&item.name)
            .and_then(|q| q.pop_front())
            .unwrap_or(StageStatus::Success);
        StageOutcome {
            stage: self.stage,
            status,
            attempts: 1,
            elapsed: Duration::ZERO,
        }
    }
}

fn fail(message: &str) -> StageStatus {
    StageStatus::Failed {
        diagnostic: Diagnostic::new(message),
    }
}

#[derive(Clone, Copy)]
enum PublishMode {
    Ok,
    Err,
    Hang,
    NoAssets,
}

struct RecordingPublisher {
    mode: PublishMode,
    events: Events,
    published: Mutex<Vec<Vec<String>>>,
}

#[async_trait::async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, items: &[WorkItem]) -> anyhow::Result<PublishReceipt> {
        push(&self.events, "publish".to_string());
        self.published
            .lock()
            .unwrap()
            .push(items.iter().map(|i| i.name.clone()).collect());
        let assets = items
            .iter()
            .map(|i| PublishedAsset {
                item: i.name.clone(),
                filename: format!("{}-universal-patched.apk", i.name),
                size_bytes: 1024 * 1024,
                variant: "universal".into(),
            })
            .collect();
        match self.mode {
            PublishMode::Ok => Ok(PublishReceipt {
                release_id: "patched-test".into(),
                url: None,
                assets,
            }),
            PublishMode::Err => anyhow::bail!("upload rejected"),
            PublishMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
            PublishMode::NoAssets => Ok(PublishReceipt {
                release_id: "patched-test".into(),
                url: None,
                assets: vec![],
            }),
        }
    }
}

#[derive(Clone, Copy)]
enum ReportMode {
    Filed,
    Err,
    Hang,
}

struct RecordingReporter {
    modes: HashMap<String, ReportMode>,
    events: Events,
}

#[async_trait::async_trait]
impl FailureReporter for RecordingReporter {
    async fn report(&self, item: &WorkItem, outcome: &StageOutcome) -> anyhow::Result<bool> {
        push(&self.events, format!("report:{}:{}", item.name, outcome.stage));
        match self.modes.get(&item.name).copied().unwrap_or(ReportMode::Filed) {
            ReportMode::Filed => Ok(true),
            ReportMode::Err => anyhow::bail!("tracker unavailable"),
            ReportMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(true)
            }
        }
    }
}

/// History that can read but never write.
struct ReadOnlyHistory;

impl HistoryStore for ReadOnlyHistory {
    fn load(&self) -> Result<History, HistoryError> {
        Ok(History::default())
    }
    fn append_run(&self, _record: &RunRecord) -> Result<(), HistoryError> {
        Err(HistoryError::Poisoned)
    }
    fn append_release(&self, _record: &ReleaseRecord) -> Result<(), HistoryError> {
        Err(HistoryError::Poisoned)
    }
}

struct Harness {
    events: Events,
    fetch: Arc<ScriptedStage>,
    transform: Arc<ScriptedStage>,
    publisher: Arc<RecordingPublisher>,
    history: Arc<MemoryHistory>,
    orchestrator: Orchestrator,
}

struct Builder {
    events: Events,
    fetch: ScriptedStage,
    transform: ScriptedStage,
    publish: PublishMode,
    reports: HashMap<String, ReportMode>,
    settings: Settings,
}

impl Builder {
    fn new() -> Self {
        let events = Events::default();
        Self {
            fetch: ScriptedStage::new(Stage::Fetch, events.clone()),
            transform: ScriptedStage::new(Stage::Transform, events.clone()),
            events,
            publish: PublishMode::Ok,
            reports: HashMap::new(),
            settings: Settings {
                retry: RetryPolicy::immediate(2),
                report_on_failure: true,
                concurrency: 1,
                stage_timeout: Duration::from_secs(5),
                collaborator_timeout: Duration::from_millis(200),
            },
        }
    }

    fn build(self) -> Harness {
        let fetch = Arc::new(self.fetch);
        let transform = Arc::new(self.transform);
        let publisher = Arc::new(RecordingPublisher {
            mode: self.publish,
            events: self.events.clone(),
            published: Mutex::new(Vec::new()),
        });
        let reporter = Arc::new(RecordingReporter {
            modes: self.reports,
            events: self.events.clone(),
        });
        let history = Arc::new(MemoryHistory::new());
        let collaborators = Collaborators {
            fetch: fetch.clone(),
            transform: transform.clone(),
            publisher: publisher.clone(),
            reporter,
        };
        Harness {
            events: self.events,
            fetch,
            transform,
            publisher,
            history: history.clone(),
            orchestrator: Orchestrator::new(self.settings, collaborators, history),
        }
    }
}

impl Harness {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn reports(&self) -> Vec<String> {
        self.events().into_iter().filter(|e| e.starts_with("report:")).collect()
    }

    fn publish_calls(&self) -> Vec<Vec<String>> {
        self.publisher.published.lock().unwrap().clone()
    }
}

fn items(names: &[&str]) -> Vec<WorkItem> {
    names
        .iter()
        .map(|n| WorkItem::new(*n, format!("https://dl.example/{}.apk", n), format!("com.{}", n)))
        .collect()
}

fn assert_totals_consistent(record: &RunRecord, input_len: usize) {
    assert_eq!(record.items.succeeded + record.items.failed, record.items.attempted);
    assert!(record.items.attempted as usize <= input_len);
}

#[tokio::test]
async fn test_empty_input_records_successful_empty_run() {
    let h = Builder::new().build();
    let record = h.orchestrator.run(&[], TriggerKind::Manual).await.unwrap();

    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.items.attempted, 0);
    assert!(!record.published);
    assert!(h.events().is_empty());

    let history = h.history.load().unwrap();
    assert_eq!(history.runs, vec![record]);
    assert!(history.releases.is_empty());
}

#[tokio::test]
async fn test_mixed_outcomes_publish_survivors_and_report_failures() {
    let mut b = Builder::new();
    b.fetch = b.fetch.script("b", vec![fail("404"), fail("404"), fail("404")]);
    b.transform = b.transform.script("c", vec![fail("patch"), fail("patch"), fail("patch")]);
    let h = b.build();

    let input = items(&["a", "b", "c"]);
    let record = h.orchestrator.run(&input, TriggerKind::Schedule).await.unwrap();

    assert_eq!(record.status, RunStatus::Partial);
    assert_eq!((record.items.attempted, record.items.succeeded, record.items.failed), (3, 1, 2));
    assert_totals_consistent(&record, input.len());

    let failed: Vec<(&str, Stage)> = record
        .failed_items
        .iter()
        .map(|f| (f.name.as_str(), f.stage))
        .collect();
    assert_eq!(failed, vec![("b", Stage::Fetch), ("c", Stage::Transform)]);
    assert!(record.failed_items.iter().all(|f| f.attempts == 3));

    // Transform never ran for the item whose fetch failed.
    assert_eq!(h.transform.calls("b"), 0);
    assert_eq!(record.transform.skipped, 1);

    assert_eq!(h.publish_calls(), vec![vec!["a".to_string()]]);
    let mut reports = h.reports();
    reports.sort();
    assert_eq!(reports, vec!["report:b:fetch", "report:c:transform"]);
    assert_eq!(record.reports_filed, 2);

    let history = h.history.load().unwrap();
    assert_eq!(history.runs.len(), 1);
    assert_eq!(history.releases.len(), 1);
    assert_eq!(history.releases[0].run_id, record.run_id);
    assert_eq!(history.releases[0].item_count(), 1);
    assert_eq!(record.release_id.as_deref(), Some("patched-test"));
}

#[tokio::test]
async fn test_all_success() {
    let h = Builder::new().build();
    let input = items(&["a", "b"]);
    let record = h.orchestrator.run(&input, TriggerKind::ConfigChange).await.unwrap();

    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.items.succeeded, 2);
    assert!(record.published);
    assert!(h.reports().is_empty());
    assert_eq!(record.fetch.attempted, 2);
    assert_eq!(record.transform.succeeded, 2);
    assert_eq!(record.fetch.retries, 0);
}

#[tokio::test]
async fn test_publish_waits_for_every_item() {
    let mut b = Builder::new();
    b.settings.concurrency = 3;
    b.fetch = b.fetch.slow("a", Duration::from_millis(120));
    b.transform = b.transform.slow("b", Duration::from_millis(60));
    let h = b.build();

    h.orchestrator
        .run(&items(&["a", "b", "c"]), TriggerKind::Manual)
        .await
        .unwrap();

    let events = h.events();
    let publish_at = events.iter().position(|e| e == "publish").unwrap();
    let last_stage = events
        .iter()
        .rposition(|e| e.starts_with("transform:"))
        .unwrap();
    assert!(publish_at > last_stage, "publish ran before all items finished: {:?}", events);
    assert_eq!(h.publish_calls().len(), 1);
    assert_eq!(h.publish_calls()[0].len(), 3);
}

#[tokio::test]
async fn test_publish_failure_is_run_level() {
    let mut b = Builder::new();
    b.publish = PublishMode::Err;
    let h = b.build();

    let record = h.orchestrator.run(&items(&["a", "b"]), TriggerKind::Manual).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert!(!record.published);
    assert!(record.diagnostics.iter().any(|d| d.contains("upload rejected")));
    // Items that transformed fine are not turned into item failures.
    assert_eq!(record.items.failed, 0);
    assert!(h.reports().is_empty());

    let history = h.history.load().unwrap();
    assert_eq!(history.runs.len(), 1);
    assert!(history.releases.is_empty());
}

#[tokio::test]
async fn test_publish_timeout_and_empty_receipt_are_failures() {
    for mode in [PublishMode::Hang, PublishMode::NoAssets] {
        let mut b = Builder::new();
        b.publish = mode;
        let h = b.build();

        let record = h.orchestrator.run(&items(&["a"]), TriggerKind::Manual).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.diagnostics.len(), 1);
        assert!(h.history.load().unwrap().releases.is_empty());
    }
}

#[tokio::test]
async fn test_no_publish_when_nothing_succeeded() {
    let mut b = Builder::new();
    b.fetch = b.fetch.script("a", vec![fail("x"), fail("x"), fail("x")]);
    let h = b.build();

    let record = h.orchestrator.run(&items(&["a"]), TriggerKind::Manual).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(h.publish_calls().is_empty());
    assert_eq!(h.reports(), vec!["report:a:fetch"]);
}

#[tokio::test]
async fn test_reporter_errors_and_timeouts_do_not_fail_the_run() {
    let mut b = Builder::new();
    for name in ["a", "b", "c"] {
        b.fetch = b.fetch.script(name, vec![fail("x"), fail("x"), fail("x")]);
    }
    b.reports.insert("a".into(), ReportMode::Err);
    b.reports.insert("b".into(), ReportMode::Hang);
    let h = b.build();

    let record = h
        .orchestrator
        .run(&items(&["a", "b", "c"]), TriggerKind::Manual)
        .await
        .unwrap();

    assert_eq!(record.reports_filed, 1);
    assert_eq!(record.diagnostics.len(), 2);
    assert!(record.diagnostics.iter().any(|d| d.contains("tracker unavailable")));
    assert!(record.diagnostics.iter().any(|d| d.contains("timed out")));
    assert_eq!(h.history.load().unwrap().runs.len(), 1);
}

#[tokio::test]
async fn test_reporting_disabled() {
    let mut b = Builder::new();
    b.settings.report_on_failure = false;
    b.fetch = b.fetch.script("a", vec![fail("x"), fail("x"), fail("x")]);
    let h = b.build();

    let record = h.orchestrator.run(&items(&["a", "b"]), TriggerKind::Manual).await.unwrap();
    assert_eq!(record.status, RunStatus::Partial);
    assert!(h.reports().is_empty());
    assert_eq!(record.reports_filed, 0);
}

#[tokio::test]
async fn test_retry_recovers_on_third_attempt() {
    let mut b = Builder::new();
    b.transform = b.transform.script("a", vec![fail("flaky"), fail("flaky")]);
    let h = b.build();

    let record = h.orchestrator.run(&items(&["a"]), TriggerKind::Manual).await.unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(h.transform.calls("a"), 3);
    assert_eq!(record.transform.retries, 2);
}

#[tokio::test]
async fn test_retry_cap_is_respected() {
    let mut b = Builder::new();
    b.fetch = b.fetch.script("a", vec![fail("down"); 10]);
    let h = b.build();

    let record = h.orchestrator.run(&items(&["a"]), TriggerKind::Manual).await.unwrap();
    assert_eq!(h.fetch.calls("a"), 3);
    assert_eq!(record.failed_items[0].attempts, 3);
    assert_eq!(record.failed_items[0].diagnostic.message, "down");
}

#[tokio::test]
async fn test_stage_timeout_counts_as_failure() {
    let mut b = Builder::new();
    b.settings.retry = RetryPolicy::immediate(0);
    b.settings.stage_timeout = Duration::from_millis(50);
    b.fetch = b.fetch.slow("a", Duration::from_secs(5));
    let h = b.build();

    let record = h.orchestrator.run(&items(&["a"]), TriggerKind::Manual).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.failed_items[0].diagnostic.message.contains("timed out"));
}

#[tokio::test]
async fn test_skipped_outcome_withdraws_item() {
    let mut b = Builder::new();
    b.transform = b.transform.script(
        "a",
        vec![StageStatus::Skipped {
            reason: "already patched".into(),
        }],
    );
    let h = b.build();

    let record = h.orchestrator.run(&items(&["a", "b"]), TriggerKind::Manual).await.unwrap();
    assert_eq!(record.items.attempted, 1);
    assert_eq!(record.items.succeeded, 1);
    assert_eq!(h.publish_calls(), vec![vec!["b".to_string()]]);
    assert_eq!(h.transform.calls("a"), 1);
    assert!(h.reports().is_empty());
}

#[tokio::test]
async fn test_disabled_items_are_not_processed() {
    let h = Builder::new().build();
    let mut input = items(&["a", "b"]);
    input[1].enabled = false;

    let record = h.orchestrator.run(&input, TriggerKind::Manual).await.unwrap();
    assert_eq!(record.items.attempted, 1);
    assert_eq!(h.fetch.calls("b"), 0);
}

#[tokio::test]
async fn test_invalid_items_record_nothing() {
    let h = Builder::new().build();
    let mut input = items(&["a", "a"]);
    input.push(WorkItem::new("c", "", "com.c"));

    let err = h.orchestrator.run(&input, TriggerKind::Manual).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidItems(_)));
    assert!(h.events().is_empty());
    assert!(h.history.load().unwrap().runs.is_empty());
}

fn plain_collaborators(events: &Events) -> Collaborators {
    Collaborators {
        fetch: Arc::new(ScriptedStage::new(Stage::Fetch, events.clone())),
        transform: Arc::new(ScriptedStage::new(Stage::Transform, events.clone())),
        publisher: Arc::new(RecordingPublisher {
            mode: PublishMode::Ok,
            events: events.clone(),
            published: Mutex::new(Vec::new()),
        }),
        reporter: Arc::new(RecordingReporter {
            modes: HashMap::new(),
            events: events.clone(),
        }),
    }
}

#[tokio::test]
async fn test_history_failure_surfaces_with_record() {
    let events = Events::default();
    let orchestrator = Orchestrator::new(Settings::default(), plain_collaborators(&events), Arc::new(ReadOnlyHistory));

    match orchestrator.run(&items(&["a"]), TriggerKind::Manual).await {
        Err(PipelineError::HistoryUnsaved { record, source }) => {
            assert_eq!(record.status, RunStatus::Success);
            assert!(record.published);
            assert!(matches!(source, HistoryError::Poisoned));
        }
        other => panic!("expected HistoryUnsaved, got {:?}", other.map(|r| r.status)),
    }
    // The work itself still happened.
    assert!(events.lock().unwrap().contains(&"publish".to_string()));
}

/// Stores runs but rejects release records.
struct RunsOnlyHistory(MemoryHistory);

impl HistoryStore for RunsOnlyHistory {
    fn load(&self) -> Result<History, HistoryError> {
        self.0.load()
    }
    fn append_run(&self, record: &RunRecord) -> Result<(), HistoryError> {
        self.0.append_run(record)
    }
    fn append_release(&self, _record: &ReleaseRecord) -> Result<(), HistoryError> {
        Err(HistoryError::Poisoned)
    }
}

#[tokio::test]
async fn test_release_failure_is_reported_separately_from_run_failure() {
    let events = Events::default();
    let store = Arc::new(RunsOnlyHistory(MemoryHistory::new()));
    let orchestrator = Orchestrator::new(Settings::default(), plain_collaborators(&events), store.clone());

    let err = orchestrator.run(&items(&["a"]), TriggerKind::Manual).await.unwrap_err();
    assert!(err.to_string().contains("release record is unsaved"), "{}", err);
    match err {
        PipelineError::ReleaseUnsaved { record, .. } => {
            let history = store.load().unwrap();
            assert_eq!(history.runs.len(), 1);
            assert_eq!(history.runs[0].run_id, record.run_id);
            assert!(history.releases.is_empty());
        }
        other => panic!("expected ReleaseUnsaved, got {:?}", other),
    }
}

#[tokio::test]
async fn test_run_can_be_spawned_onto_the_runtime() {
    let Harness {
        orchestrator, history, ..
    } = Builder::new().build();
    let orchestrator = Arc::new(orchestrator);
    let input = items(&["a", "b"]);

    let handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(&input, TriggerKind::Schedule).await }
    });
    let record = handle.await.unwrap().unwrap();

    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.items.succeeded, 2);
    assert_eq!(history.load().unwrap().runs.len(), 1);
}

#[tokio::test]
async fn test_skip_record_and_history_cap() {
    let h = Builder::new().build();
    for _ in 0..RUN_HISTORY_CAP {
        h.orchestrator.run(&[], TriggerKind::Schedule).await.unwrap();
    }
    let skipped = h
        .orchestrator
        .record_skip(TriggerKind::Manual, "maintenance window")
        .await
        .unwrap();

    let history = h.history.load().unwrap();
    assert_eq!(history.runs.len(), RUN_HISTORY_CAP);
    assert_eq!(history.runs.last(), Some(&skipped));
    assert_eq!(skipped.status, RunStatus::Skipped);
    assert_eq!(skipped.reason.as_deref(), Some("maintenance window"));

    let view = h.orchestrator.summary().await.unwrap();
    assert_eq!(view.total_runs, RUN_HISTORY_CAP);
    assert_eq!(view.success_rate.0, None);
}
