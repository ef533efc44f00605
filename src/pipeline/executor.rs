//! Collaborator contracts the orchestrator drives.
//!
//! Fetch and Transform share [`StageExecutor`]; Publish and failure reporting
//! get their own traits since they run once per run and once per failed item.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::{StageOutcome, WorkItem};

/// A per-item stage (fetch, transform).
///
/// Implementations never return an error: any internal fault becomes a
/// failed [`StageOutcome`] with a diagnostic.
#[async_trait::async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> StageOutcome;
}

/// One asset uploaded as part of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedAsset {
    /// Name of the work item the asset was built from.
    pub item: String,
    pub filename: String,
    pub size_bytes: u64,
    pub variant: String,
}

/// What a publisher hands back after a successful release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub release_id: String,
    pub url: Option<String>,
    pub assets: Vec<PublishedAsset>,
}

/// Publishes the full set of successfully transformed items in one go.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, items: &[WorkItem]) -> Result<PublishReceipt>;
}

/// Files a tracking record for an item that failed.
#[async_trait::async_trait]
pub trait FailureReporter: Send + Sync {
    /// Returns `Ok(true)` when a report was filed or updated.
    async fn report(&self, item: &WorkItem, outcome: &StageOutcome) -> Result<bool>;
}
