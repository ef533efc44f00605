//! Filesystem publisher and reporter, for runs without GitHub access.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::workspace::Workspace;
use super::{collect_assets, release_tag, report_body, report_title};
use crate::pipeline::{Diagnostic, FailureReporter, PublishReceipt, Publisher, Stage, StageOutcome, WorkItem};

const MANIFEST_FILE: &str = "release.json";

/// Copies transformed artifacts into `<releases_dir>/<tag>/`.
pub struct LocalPublisher {
    workspace: Workspace,
    releases_dir: PathBuf,
    tag_prefix: String,
}

impl LocalPublisher {
    pub fn new(workspace: Workspace, releases_dir: PathBuf, tag_prefix: &str) -> Self {
        Self {
            workspace,
            releases_dir,
            tag_prefix: tag_prefix.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Publisher for LocalPublisher {
    async fn publish(&self, items: &[WorkItem]) -> Result<PublishReceipt> {
        let assets = collect_assets(&self.workspace, items);
        if assets.is_empty() {
            anyhow::bail!("none of the {} succeeded item(s) has a transformed artifact", items.len());
        }

        let tag = release_tag(&self.tag_prefix, Utc::now());
        let dir = self.releases_dir.join(&tag);
        if dir.exists() {
            info!(%tag, "Replacing existing local release");
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        for (path, asset) in &assets {
            tokio::fs::copy(path, dir.join(&asset.filename))
                .await
                .with_context(|| format!("Failed to copy {}", path.display()))?;
        }

        let receipt = PublishReceipt {
            release_id: tag,
            url: Some(dir.to_string_lossy().into_owned()),
            assets: assets.into_iter().map(|(_, a)| a).collect(),
        };
        let manifest = serde_json::to_vec_pretty(&receipt)?;
        tokio::fs::write(dir.join(MANIFEST_FILE), manifest)
            .await
            .context("Failed to write release manifest")?;

        info!(release = %receipt.release_id, dir = %dir.display(), "Local release written");
        Ok(receipt)
    }
}

/// One failure report file per item and stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalReport {
    pub title: String,
    pub item: String,
    pub target: String,
    pub stage: Stage,
    pub occurrences: Vec<Occurrence>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub at: DateTime<Utc>,
    pub attempts: u32,
    pub diagnostic: Option<Diagnostic>,
    pub body: String,
}

/// Writes failure reports as JSON under `reports_dir`. A repeat failure is
/// appended to the existing report instead of creating a new one.
pub struct LocalReporter {
    reports_dir: PathBuf,
}

impl LocalReporter {
    pub fn new(reports_dir: PathBuf) -> Self {
        Self { reports_dir }
    }

    pub fn report_path(&self, item: &WorkItem, stage: Stage) -> PathBuf {
        self.reports_dir.join(format!("{}-{}.json", item.name, stage))
    }
}

#[async_trait::async_trait]
impl FailureReporter for LocalReporter {
    async fn report(&self, item: &WorkItem, outcome: &StageOutcome) -> Result<bool> {
        tokio::fs::create_dir_all(&self.reports_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.reports_dir.display()))?;

        let path = self.report_path(item, outcome.stage);
        let mut report = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<LocalReport>(&bytes)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LocalReport {
                title: report_title(item, outcome),
                item: item.name.clone(),
                target: item.target.clone(),
                stage: outcome.stage,
                occurrences: Vec::new(),
            },
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };

        report.occurrences.push(Occurrence {
            at: Utc::now(),
            attempts: outcome.attempts,
            diagnostic: outcome.diagnostic().cloned(),
            body: report_body(item, outcome),
        });

        tokio::fs::write(&path, serde_json::to_vec_pretty(&report)?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(item = %item.name, path = %path.display(), occurrences = report.occurrences.len(), "Failure report written");
        Ok(true)
    }
}
