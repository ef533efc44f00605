//! Run and release records -- the only things the pipeline persists.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Diagnostic, Provenance, PublishReceipt, Stage, StageOutcome, StageStatus, TriggerKind, WorkItem};

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
    Skipped,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Aggregate counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageCounts {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Attempts beyond the first, summed over items.
    pub retries: u32,
}

impl StageCounts {
    fn record(&mut self, outcome: &StageOutcome) {
        match outcome.status {
            StageStatus::Success => {
                self.attempted += 1;
                self.succeeded += 1;
            }
            StageStatus::Failed { .. } => {
                self.attempted += 1;
                self.failed += 1;
            }
            StageStatus::Skipped { .. } => self.skipped += 1,
        }
        self.retries += outcome.attempts.saturating_sub(1);
    }
}

/// Item-level totals. `succeeded + failed == attempted` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemTotals {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Summary of an item that did not make it through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub name: String,
    pub target: String,
    pub stage: Stage,
    pub diagnostic: Diagnostic,
    pub attempts: u32,
}

/// A closed, immutable record of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub trigger: TriggerKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub items: ItemTotals,
    #[serde(default)]
    pub fetch: StageCounts,
    #[serde(default)]
    pub transform: StageCounts,
    #[serde(default)]
    pub failed_items: Vec<FailedItem>,
    #[serde(default)]
    pub published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
    #[serde(default)]
    pub reports_filed: u32,
    /// Run-level problems: publish failures, reporter errors.
    #[serde(default)]
    pub diagnostics: Vec<String>,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunRecord {
    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// The open state of a run. Only [`RunBuilder::close`] produces a
/// [`RunRecord`], so nothing half-built can reach history.
#[derive(Debug)]
pub(crate) struct RunBuilder {
    run_id: Uuid,
    trigger: TriggerKind,
    started_at: DateTime<Utc>,
    provenance: Provenance,
    items: ItemTotals,
    fetch: StageCounts,
    transform: StageCounts,
    failed_items: Vec<FailedItem>,
    publish_error: bool,
    release_id: Option<String>,
    reports_filed: u32,
    diagnostics: Vec<String>,
}

impl RunBuilder {
    pub(crate) fn open(trigger: TriggerKind, provenance: Provenance) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            trigger,
            started_at: Utc::now(),
            provenance,
            items: ItemTotals::default(),
            fetch: StageCounts::default(),
            transform: StageCounts::default(),
            failed_items: Vec::new(),
            publish_error: false,
            release_id: None,
            reports_filed: 0,
            diagnostics: Vec::new(),
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) fn record_fetch(&mut self, outcome: &StageOutcome) {
        self.fetch.record(outcome);
    }

    pub(crate) fn record_transform(&mut self, outcome: &StageOutcome) {
        self.transform.record(outcome);
    }

    /// Transform was never attempted because fetch did not succeed.
    pub(crate) fn skip_transform(&mut self) {
        self.transform.skipped += 1;
    }

    pub(crate) fn item_succeeded(&mut self) {
        self.items.attempted += 1;
        self.items.succeeded += 1;
    }

    pub(crate) fn item_failed(&mut self, item: &WorkItem, outcome: &StageOutcome) {
        self.items.attempted += 1;
        self.items.failed += 1;
        let diagnostic = outcome
            .diagnostic()
            .cloned()
            .unwrap_or_else(|| Diagnostic::new("unknown failure"));
        self.failed_items.push(FailedItem {
            name: item.name.clone(),
            target: item.target.clone(),
            stage: outcome.stage,
            diagnostic,
            attempts: outcome.attempts,
        });
    }

    pub(crate) fn published(&mut self, release_id: String) {
        self.release_id = Some(release_id);
    }

    pub(crate) fn publish_failed(&mut self, message: String) {
        self.publish_error = true;
        self.diagnostics.push(message);
    }

    pub(crate) fn report_filed(&mut self) {
        self.reports_filed += 1;
    }

    pub(crate) fn diagnostic(&mut self, message: String) {
        self.diagnostics.push(message);
    }

    fn status(&self) -> RunStatus {
        if self.items.attempted > 0 && (self.items.succeeded == 0 || self.publish_error) {
            RunStatus::Failed
        } else if self.items.failed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Success
        }
    }

    pub(crate) fn close(self) -> RunRecord {
        let status = self.status();
        RunRecord {
            run_id: self.run_id,
            trigger: self.trigger,
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            items: self.items,
            fetch: self.fetch,
            transform: self.transform,
            failed_items: self.failed_items,
            published: self.release_id.is_some(),
            release_id: self.release_id,
            reports_filed: self.reports_filed,
            diagnostics: self.diagnostics,
            provenance: self.provenance,
            reason: None,
        }
    }

    /// Close as a skipped run that never touched any item.
    pub(crate) fn close_skipped(self, reason: String) -> RunRecord {
        let mut record = self.close();
        record.status = RunStatus::Skipped;
        record.reason = Some(reason);
        record
    }
}

/// One published artifact inside a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedItem {
    pub name: String,
    #[serde(default)]
    pub target: String,
    pub filename: String,
    pub size_bytes: u64,
    pub variant: String,
}

/// A successful publish action, linked to its run by `run_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub release_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub run_id: Uuid,
    pub published_at: DateTime<Utc>,
    pub items: Vec<ReleasedItem>,
    pub total_size_bytes: u64,
    /// Item name -> variants published for it.
    #[serde(default)]
    pub variants: BTreeMap<String, Vec<String>>,
}

impl ReleaseRecord {
    /// Build the record from a publisher receipt. `items` resolves each
    /// asset back to its work item target.
    pub(crate) fn from_receipt(run_id: Uuid, receipt: PublishReceipt, items: &[WorkItem]) -> Self {
        let mut variants: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut released = Vec::with_capacity(receipt.assets.len());
        let mut total_size_bytes = 0u64;

        for asset in receipt.assets {
            let target = items
                .iter()
                .find(|i| i.name == asset.item)
                .map(|i| i.target.clone())
                .unwrap_or_default();
            total_size_bytes += asset.size_bytes;
            variants
                .entry(asset.item.clone())
                .or_default()
                .push(asset.variant.clone());
            released.push(ReleasedItem {
                name: asset.item,
                target,
                filename: asset.filename,
                size_bytes: asset.size_bytes,
                variant: asset.variant,
            });
        }

        Self {
            release_id: receipt.release_id,
            url: receipt.url,
            run_id,
            published_at: Utc::now(),
            items: released,
            total_size_bytes,
            variants,
        }
    }

    pub fn total_size_mb(&self) -> f64 {
        bytes_to_mb(self.total_size_bytes)
    }

    /// Number of distinct work items in the release.
    pub fn item_count(&self) -> usize {
        self.items
            .iter()
            .map(|i| i.name.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PublishedAsset;
    use std::time::Duration;

    fn failed(stage: Stage) -> StageOutcome {
        let mut o = StageOutcome::failed(stage, Diagnostic::new("nope"), Duration::ZERO);
        o.attempts = 3;
        o
    }

    #[test]
    fn test_empty_run_is_success_with_zero_counts() {
        let record = RunBuilder::open(TriggerKind::Manual, Provenance::default()).close();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.items, ItemTotals::default());
        assert!(!record.published);
        assert!(record.finished_at >= record.started_at);
    }

    #[test]
    fn test_counts_and_status() {
        let item = WorkItem::new("b", "src", "com.b");
        let mut run = RunBuilder::open(TriggerKind::Schedule, Provenance::default());
        run.record_fetch(&StageOutcome::success(Stage::Fetch, Duration::ZERO));
        run.record_transform(&StageOutcome::success(Stage::Transform, Duration::ZERO));
        run.item_succeeded();
        let f = failed(Stage::Fetch);
        run.record_fetch(&f);
        run.skip_transform();
        run.item_failed(&item, &f);
        run.published("patched-2026-01-01".into());

        let record = run.close();
        assert_eq!(record.status, RunStatus::Partial);
        assert_eq!(record.items.attempted, 2);
        assert_eq!(record.items.succeeded + record.items.failed, record.items.attempted);
        assert_eq!(record.fetch.retries, 2);
        assert_eq!(record.transform.skipped, 1);
        assert_eq!(record.failed_items[0].stage, Stage::Fetch);
        assert_eq!(record.failed_items[0].attempts, 3);
        assert!(record.published);
    }

    #[test]
    fn test_publish_failure_fails_the_run() {
        let mut run = RunBuilder::open(TriggerKind::Manual, Provenance::default());
        run.item_succeeded();
        run.publish_failed("publish failed: 502".into());
        let record = run.close();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(!record.published);
        assert_eq!(record.diagnostics.len(), 1);
    }

    #[test]
    fn test_release_from_receipt_groups_variants() {
        let items = vec![WorkItem::new("YouTube", "s", "com.google.android.youtube")];
        let receipt = PublishReceipt {
            release_id: "patched-2026-10-19".into(),
            url: Some("https://example.invalid/r/1".into()),
            assets: vec![
                PublishedAsset {
                    item: "YouTube".into(),
                    filename: "yt-arm64-v8a-patched.apk".into(),
                    size_bytes: 3 * 1024 * 1024,
                    variant: "arm64-v8a".into(),
                },
                PublishedAsset {
                    item: "YouTube".into(),
                    filename: "yt-x86_64-patched.apk".into(),
                    size_bytes: 1024 * 1024,
                    variant: "x86_64".into(),
                },
            ],
        };
        let release = ReleaseRecord::from_receipt(Uuid::new_v4(), receipt, &items);
        assert_eq!(release.total_size_mb(), 4.0);
        assert_eq!(release.item_count(), 1);
        assert_eq!(release.variants["YouTube"], vec!["arm64-v8a", "x86_64"]);
        assert_eq!(release.items[0].target, "com.google.android.youtube");
    }

    #[test]
    fn test_record_tolerates_additive_fields() {
        let record = RunBuilder::open(TriggerKind::Manual, Provenance::default()).close();
        let mut value = serde_json::to_value(&record).unwrap();
        value["added_later"] = serde_json::json!({"x": 1});
        let back: RunRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
