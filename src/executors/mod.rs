//! Concrete collaborators: fetch over HTTP, transform via an external
//! command, publish and report to GitHub or the local filesystem.

pub mod fetch;
pub mod github;
pub mod local;
pub mod transform;
pub mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub use self::fetch::HttpFetcher;
pub use self::github::{GithubClient, GithubIssueReporter, GithubPublisher};
pub use self::local::{LocalPublisher, LocalReporter};
pub use self::transform::CommandTransformer;
pub use self::workspace::{detect_variant, Workspace};

use crate::config::{PipelineConfig, PublishKind, ReportKind};
use crate::pipeline::{Collaborators, FailureReporter, PublishedAsset, StageOutcome, WorkItem};

/// Wire up the collaborators named in `config`.
pub fn build(config: &PipelineConfig) -> Result<Collaborators> {
    let workspace = Workspace::new(&config.workspace);

    let publisher: Arc<dyn crate::pipeline::Publisher> = match config.publish.kind {
        PublishKind::Github => {
            let client = GithubClient::from_config(&config.publish.github)?;
            Arc::new(GithubPublisher::new(client, workspace.clone(), &config.publish.tag_prefix))
        }
        PublishKind::Local => Arc::new(LocalPublisher::new(
            workspace.clone(),
            config.publish.releases_dir.clone(),
            &config.publish.tag_prefix,
        )),
    };

    let reporter: Arc<dyn FailureReporter> = match config.report.kind {
        ReportKind::Github => {
            let client = GithubClient::from_config(&config.report.github)?;
            Arc::new(GithubIssueReporter::new(client, config.report.labels.clone()))
        }
        ReportKind::Local => Arc::new(LocalReporter::new(config.report.reports_dir.clone())),
        ReportKind::None => Arc::new(NullReporter),
    };

    info!(publish = ?config.publish.kind, report = ?config.report.kind, "Collaborators ready");

    Ok(Collaborators {
        fetch: Arc::new(HttpFetcher::new(workspace.clone())?),
        transform: Arc::new(CommandTransformer::new(config.transform.clone(), workspace)),
        publisher,
        reporter,
    })
}

/// Reporter that files nothing.
pub struct NullReporter;

#[async_trait::async_trait]
impl FailureReporter for NullReporter {
    async fn report(&self, _item: &WorkItem, _outcome: &StageOutcome) -> Result<bool> {
        Ok(false)
    }
}

/// Release tag for a given day: `<prefix>-YYYY-MM-DD`.
pub fn release_tag(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, at.format("%Y-%m-%d"))
}

/// Transformed artifacts ready to publish, with their asset metadata.
/// Items whose output is missing are left out with a warning.
pub(crate) fn collect_assets(workspace: &Workspace, items: &[WorkItem]) -> Vec<(PathBuf, PublishedAsset)> {
    let mut assets = Vec::new();
    for item in items {
        let path = workspace.output_path(item);
        let size_bytes = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(item = %item.name, path = %path.display(), error = %e, "Transformed artifact missing, not publishing");
                continue;
            }
        };
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        // The item name prefix is not part of the build, so it is not searched.
        let variant = detect_variant(&workspace::artifact_name(item)).to_string();
        assets.push((
            path,
            PublishedAsset {
                item: item.name.clone(),
                filename,
                size_bytes,
                variant,
            },
        ));
    }
    assets
}

/// Stable title for a failure report, so repeats land on the same record.
pub fn report_title(item: &WorkItem, outcome: &StageOutcome) -> String {
    format!("Pipeline failure: {} ({} stage)", item.name, outcome.stage)
}

/// Markdown body shared by the issue and local reporters.
pub fn report_body(item: &WorkItem, outcome: &StageOutcome) -> String {
    let mut body = format!(
        "**Item:** {}\n**Target:** `{}`\n**Stage:** {}\n**Attempts:** {}\n**Time:** {}\n",
        item.name,
        item.target,
        outcome.stage,
        outcome.attempts,
        Utc::now().to_rfc3339()
    );
    if let Some(diagnostic) = outcome.diagnostic() {
        body.push_str(&format!("\n**Error:** {}\n", diagnostic));
        if let Some(detail) = &diagnostic.detail {
            body.push_str(&format!("\n```\n{}\n```\n", detail));
        }
    }
    body
}
