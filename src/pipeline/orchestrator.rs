//! The pipeline orchestrator.
//!
//! One call to [`Orchestrator::run`] is one run: fetch and transform every
//! item under the retry policy, publish the survivors once, report the
//! failures, then append the closed run record (and release record) to
//! history.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use super::record::{ReleaseRecord, RunBuilder, RunRecord};
use super::retry::RetryPolicy;
use super::summary::{summary, SummaryView};
use super::{
    Diagnostic, FailureReporter, PipelineError, Provenance, Publisher, Stage, StageExecutor,
    StageOutcome, StageStatus, TriggerKind, WorkItem,
};
use crate::history::{HistoryError, HistoryStore};

/// Run-wide knobs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub retry: RetryPolicy,
    pub report_on_failure: bool,
    /// Items processed at once. Aggregation does not depend on order.
    pub concurrency: usize,
    /// Upper bound for one fetch or transform attempt.
    pub stage_timeout: Duration,
    /// Upper bound for one publish or report call.
    pub collaborator_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            report_on_failure: true,
            concurrency: 1,
            stage_timeout: Duration::from_secs(600),
            collaborator_timeout: Duration::from_secs(300),
        }
    }
}

/// The external collaborators a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub fetch: Arc<dyn StageExecutor>,
    pub transform: Arc<dyn StageExecutor>,
    pub publisher: Arc<dyn Publisher>,
    pub reporter: Arc<dyn FailureReporter>,
}

/// Where an item ended up after fetch and transform.
enum Disposition {
    Succeeded,
    Failed(StageOutcome),
    Withdrawn(String),
}

struct ItemResult<'a> {
    item: &'a WorkItem,
    fetch: StageOutcome,
    transform: Option<StageOutcome>,
}

impl ItemResult<'_> {
    fn disposition(&self) -> Disposition {
        let last = self.transform.as_ref().unwrap_or(&self.fetch);
        match &last.status {
            StageStatus::Success => Disposition::Succeeded,
            StageStatus::Failed { .. } => Disposition::Failed(last.clone()),
            StageStatus::Skipped { reason } => Disposition::Withdrawn(reason.clone()),
        }
    }
}

pub struct Orchestrator {
    settings: Settings,
    collaborators: Collaborators,
    history: Arc<dyn HistoryStore>,
    provenance: Provenance,
}

impl Orchestrator {
    pub fn new(settings: Settings, collaborators: Collaborators, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            settings,
            collaborators,
            history,
            provenance: Provenance::default(),
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn history(&self) -> Arc<dyn HistoryStore> {
        self.history.clone()
    }

    /// Execute one pipeline pass over `items`.
    ///
    /// Item failures never fail the call. Errors are reserved for invalid
    /// input (nothing is recorded) and for history persistence failures
    /// (the work was done, the record is carried in the error).
    pub async fn run(&self, items: &[WorkItem], trigger: TriggerKind) -> Result<RunRecord, PipelineError> {
        let items = validate_items(items)?;

        let mut run = RunBuilder::open(trigger, self.provenance.clone());
        let run_id = run.run_id();
        info!(%run_id, %trigger, items = items.len(), "Pipeline run started");

        // Publish must not start before every item has a final outcome, so
        // collect everything first. The futures are built before buffering
        // so the run future stays Send when spawned.
        let pending: Vec<_> = items.iter().map(|&item| self.process_item(item)).collect();
        let results: Vec<ItemResult<'_>> = stream::iter(pending)
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut succeeded: Vec<WorkItem> = Vec::new();
        let mut failed: Vec<(&WorkItem, StageOutcome)> = Vec::new();

        for result in &results {
            run.record_fetch(&result.fetch);
            match &result.transform {
                Some(t) => run.record_transform(t),
                None => run.skip_transform(),
            }
            match result.disposition() {
                Disposition::Succeeded => {
                    run.item_succeeded();
                    succeeded.push(result.item.clone());
                }
                Disposition::Failed(outcome) => {
                    run.item_failed(result.item, &outcome);
                    failed.push((result.item, outcome));
                }
                Disposition::Withdrawn(reason) => {
                    info!(item = %result.item.name, %reason, "Item withdrawn from run");
                }
            }
        }

        let release = if succeeded.is_empty() {
            None
        } else {
            self.publish(&mut run, &succeeded).await
        };

        if !failed.is_empty() {
            if self.settings.report_on_failure {
                self.report_failures(&mut run, &failed).await;
            } else {
                debug!(failed = failed.len(), "Failure reporting disabled");
            }
        }

        let record = run.close();
        info!(
            %run_id,
            status = %record.status,
            attempted = record.items.attempted,
            succeeded = record.items.succeeded,
            failed = record.items.failed,
            published = record.published,
            reports = record.reports_filed,
            "Pipeline run finished"
        );

        persist(self.history.clone(), record, release).await
    }

    /// Record a run that was deliberately not executed.
    pub async fn record_skip(&self, trigger: TriggerKind, reason: &str) -> Result<RunRecord, PipelineError> {
        record_skip(self.history.clone(), trigger, self.provenance.clone(), reason).await
    }

    /// Summary over the current history.
    pub async fn summary(&self) -> Result<SummaryView, HistoryError> {
        let store = self.history.clone();
        let history = tokio::task::spawn_blocking(move || store.load()).await??;
        Ok(summary(&history))
    }

    async fn process_item<'a>(&self, item: &'a WorkItem) -> ItemResult<'a> {
        let fetch = self
            .run_stage(Stage::Fetch, self.collaborators.fetch.as_ref(), item)
            .await;

        let transform = if fetch.is_success() {
            Some(
                self.run_stage(Stage::Transform, self.collaborators.transform.as_ref(), item)
                    .await,
            )
        } else {
            None
        };

        ItemResult { item, fetch, transform }
    }

    async fn run_stage(&self, stage: Stage, executor: &dyn StageExecutor, item: &WorkItem) -> StageOutcome {
        let limit = self.settings.stage_timeout;
        let outcome = self
            .settings
            .retry
            .run(&item.name, |attempt| async move {
                debug!(item = %item.name, %stage, attempt, "Running stage");
                let started = Instant::now();
                match tokio::time::timeout(limit, executor.execute(item)).await {
                    Ok(mut outcome) => {
                        outcome.stage = stage;
                        outcome
                    }
                    Err(_) => StageOutcome::failed(
                        stage,
                        Diagnostic::new(format!("{} timed out after {}s", stage, limit.as_secs())),
                        started.elapsed(),
                    ),
                }
            })
            .await;

        match &outcome.status {
            StageStatus::Success => {
                info!(item = %item.name, %stage, attempts = outcome.attempts, "Stage succeeded")
            }
            StageStatus::Failed { diagnostic } => {
                warn!(item = %item.name, %stage, attempts = outcome.attempts, error = %diagnostic, "Stage failed")
            }
            StageStatus::Skipped { reason } => {
                info!(item = %item.name, %stage, %reason, "Stage skipped")
            }
        }
        outcome
    }

    async fn publish(&self, run: &mut RunBuilder, items: &[WorkItem]) -> Option<ReleaseRecord> {
        let limit = self.settings.collaborator_timeout;
        info!(items = items.len(), "Publishing release");

        let result = tokio::time::timeout(limit, self.collaborators.publisher.publish(items)).await;
        match result {
            Ok(Ok(receipt)) if receipt.assets.is_empty() => {
                warn!(release = %receipt.release_id, "Publisher returned no assets");
                run.publish_failed(format!("publish of {} produced no assets", receipt.release_id));
                None
            }
            Ok(Ok(receipt)) => {
                info!(release = %receipt.release_id, assets = receipt.assets.len(), "Release published");
                run.published(receipt.release_id.clone());
                Some(ReleaseRecord::from_receipt(run.run_id(), receipt, items))
            }
            Ok(Err(e)) => {
                error!(error = %format!("{:#}", e), "Publish failed");
                run.publish_failed(format!("publish failed: {:#}", e));
                None
            }
            Err(_) => {
                error!(timeout_secs = limit.as_secs(), "Publish timed out");
                run.publish_failed(format!("publish timed out after {}s", limit.as_secs()));
                None
            }
        }
    }

    async fn report_failures(&self, run: &mut RunBuilder, failed: &[(&WorkItem, StageOutcome)]) {
        let limit = self.settings.collaborator_timeout;
        let reporter = self.collaborators.reporter.as_ref();

        let calls = failed.iter().map(|(item, outcome)| async move {
            let result = tokio::time::timeout(limit, reporter.report(item, outcome)).await;
            (*item, result)
        });
        // All reports finish here, before history is touched.
        let results = futures::future::join_all(calls).await;

        for (item, result) in results {
            match result {
                Ok(Ok(true)) => {
                    debug!(item = %item.name, "Failure report filed");
                    run.report_filed();
                }
                Ok(Ok(false)) => debug!(item = %item.name, "Failure report not filed"),
                Ok(Err(e)) => {
                    warn!(item = %item.name, error = %format!("{:#}", e), "Failure reporter errored");
                    run.diagnostic(format!("failure report for {} failed: {:#}", item.name, e));
                }
                Err(_) => {
                    warn!(item = %item.name, "Failure reporter timed out");
                    run.diagnostic(format!(
                        "failure report for {} timed out after {}s",
                        item.name,
                        limit.as_secs()
                    ));
                }
            }
        }
    }
}

/// Append a skipped-run record without needing any collaborators.
pub async fn record_skip(
    history: Arc<dyn HistoryStore>,
    trigger: TriggerKind,
    provenance: Provenance,
    reason: &str,
) -> Result<RunRecord, PipelineError> {
    let record = RunBuilder::open(trigger, provenance).close_skipped(reason.to_string());
    info!(run_id = %record.run_id, %trigger, %reason, "Pipeline run skipped");
    persist(history, record, None).await
}

async fn persist(
    store: Arc<dyn HistoryStore>,
    record: RunRecord,
    release: Option<ReleaseRecord>,
) -> Result<RunRecord, PipelineError> {
    /// Which append failed.
    enum Unsaved {
        Run(HistoryError),
        Release(HistoryError),
    }

    let to_store = record.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<(), Unsaved> {
        store.append_run(&to_store).map_err(Unsaved::Run)?;
        if let Some(release) = &release {
            store.append_release(release).map_err(Unsaved::Release)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| Unsaved::Run(HistoryError::from(e)))
    .and_then(|r| r);

    match result {
        Ok(()) => Ok(record),
        Err(Unsaved::Run(source)) => {
            error!(run_id = %record.run_id, error = %source, "Run completed but history was not saved");
            Err(PipelineError::HistoryUnsaved {
                record: Box::new(record),
                source,
            })
        }
        Err(Unsaved::Release(source)) => {
            error!(run_id = %record.run_id, error = %source, "Run saved but its release record was not");
            Err(PipelineError::ReleaseUnsaved {
                record: Box::new(record),
                source,
            })
        }
    }
}

/// Reject malformed input before anything is recorded; drop disabled items.
fn validate_items(items: &[WorkItem]) -> Result<Vec<&WorkItem>, PipelineError> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();

    for (idx, item) in items.iter().enumerate() {
        if item.name.trim().is_empty() {
            problems.push(format!("item #{} has an empty name", idx + 1));
        } else if !seen.insert(item.name.as_str()) {
            problems.push(format!("duplicate item name '{}'", item.name));
        }
        if item.source.trim().is_empty() {
            problems.push(format!("item '{}' has an empty source", item.name));
        }
    }
    if !problems.is_empty() {
        return Err(PipelineError::InvalidItems(problems.join("; ")));
    }

    Ok(items
        .iter()
        .filter(|item| {
            if !item.enabled {
                debug!(item = %item.name, "Skipping disabled item");
            }
            item.enabled
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_duplicates_and_blank_names() {
        let items = vec![
            WorkItem::new("a", "s", "t"),
            WorkItem::new("a", "s", "t"),
            WorkItem::new(" ", "s", "t"),
        ];
        let err = validate_items(&items).unwrap_err().to_string();
        assert!(err.contains("duplicate item name 'a'"));
        assert!(err.contains("empty name"));
    }

    #[test]
    fn test_validate_drops_disabled() {
        let mut off = WorkItem::new("off", "s", "t");
        off.enabled = false;
        let items = vec![WorkItem::new("on", "s", "t"), off];
        let kept = validate_items(&items).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "on");
    }

    #[test]
    fn test_disposition_prefers_transform_outcome() {
        let item = WorkItem::new("a", "s", "t");
        let result = ItemResult {
            item: &item,
            fetch: StageOutcome::success(Stage::Fetch, Duration::ZERO),
            transform: Some(StageOutcome::failed(
                Stage::Transform,
                Diagnostic::new("bad patch"),
                Duration::ZERO,
            )),
        };
        assert!(matches!(result.disposition(), Disposition::Failed(o) if o.stage == Stage::Transform));
    }
}
