//! Static HTML dashboard over the run and release history.

use std::path::Path;

use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, Utc};

use crate::pipeline::{ReleaseRecord, RunRecord, RunStatus, SummaryView};

/// One row of the recent-runs list, preformatted for the template.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub label: String,
    pub finished_at: String,
    pub status_class: String,
    pub status_text: String,
    pub trigger: String,
    pub actor: String,
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub release: String,
    pub notes: Vec<String>,
}

impl From<&RunRecord> for RunRow {
    fn from(run: &RunRecord) -> Self {
        let label = match &run.provenance.run_number {
            Some(n) => format!("Run #{}", n),
            None => format!("Run {}", &run.run_id.simple().to_string()[..8]),
        };
        let release = match &run.release_id {
            Some(id) => id.clone(),
            None if run.status == RunStatus::Skipped => "-".to_string(),
            None => "No".to_string(),
        };
        let mut notes: Vec<String> = run.reason.iter().cloned().collect();
        notes.extend(run.diagnostics.iter().cloned());

        Self {
            label,
            finished_at: run.finished_at.format("%Y-%m-%d %H:%M").to_string(),
            status_class: run.status.to_string(),
            status_text: run.status.to_string().to_uppercase(),
            trigger: run.trigger.to_string(),
            actor: run.provenance.actor.clone().unwrap_or_else(|| "-".to_string()),
            attempted: run.items.attempted,
            succeeded: run.items.succeeded,
            failed: run.items.failed,
            release,
            notes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseRow {
    pub tag: String,
    pub url: String,
    pub date: String,
    pub item_count: usize,
    pub size: String,
    /// `name (variant, variant)` per item.
    pub variants: Vec<String>,
}

impl From<&ReleaseRecord> for ReleaseRow {
    fn from(release: &ReleaseRecord) -> Self {
        Self {
            tag: release.release_id.clone(),
            url: release.url.clone().unwrap_or_else(|| "#".to_string()),
            date: release.published_at.format("%Y-%m-%d").to_string(),
            item_count: release.item_count(),
            size: format!("{:.1} MB", release.total_size_mb()),
            variants: release
                .variants
                .iter()
                .map(|(name, vs)| format!("{} ({})", name, vs.join(", ")))
                .collect(),
        }
    }
}

#[derive(Template)]
#[template(path = "dashboard.html")]
pub struct DashboardView {
    pub generated_at: String,
    pub total_runs: usize,
    pub success_rate: String,
    pub recent_success_rate: String,
    pub total_releases: usize,
    pub runs: Vec<RunRow>,
    pub releases: Vec<ReleaseRow>,
}

impl DashboardView {
    pub fn build(summary: &SummaryView, generated_at: DateTime<Utc>) -> Self {
        Self {
            generated_at: generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            total_runs: summary.total_runs,
            success_rate: summary.success_rate.to_string(),
            recent_success_rate: summary.recent_success_rate.to_string(),
            total_releases: summary.total_releases,
            runs: summary.recent_runs.iter().map(RunRow::from).collect(),
            releases: summary.recent_releases.iter().map(ReleaseRow::from).collect(),
        }
    }

    pub fn to_html(&self) -> Result<String> {
        self.render().context("Failed to render dashboard template")
    }

    /// Render and write to `path`, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<()> {
        let html = self.to_html()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, html).with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "Dashboard written");
        Ok(())
    }
}
