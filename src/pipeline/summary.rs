//! Read-only statistics over history.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{ReleaseRecord, RunRecord, RunStatus};
use crate::history::History;

/// Runs considered for the "recent" success rate and listing.
pub const RECENT_RUNS: usize = 10;
/// Releases shown in the recent listing.
pub const RECENT_RELEASES: usize = 5;

/// Item-level success rate as a percentage, `None` when nothing was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuccessRate(pub Option<f64>);

impl SuccessRate {
    fn over<'a>(runs: impl IntoIterator<Item = &'a RunRecord>) -> Self {
        let (succeeded, attempted) = runs.into_iter().fold((0u64, 0u64), |(s, a), r| {
            (s + u64::from(r.items.succeeded), a + u64::from(r.items.attempted))
        });
        if attempted == 0 {
            return SuccessRate(None);
        }
        let pct = succeeded as f64 / attempted as f64 * 100.0;
        SuccessRate(Some((pct * 10.0).round() / 10.0))
    }
}

impl fmt::Display for SuccessRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(pct) => write!(f, "{:.1}%", pct),
            None => write!(f, "N/A"),
        }
    }
}

/// Everything the dashboard and `summary` command need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryView {
    pub total_runs: usize,
    pub successful_runs: usize,
    pub success_rate: SuccessRate,
    pub recent_success_rate: SuccessRate,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_release_at: Option<DateTime<Utc>>,
    pub total_releases: usize,
    /// Newest first.
    pub recent_runs: Vec<RunRecord>,
    /// Newest first.
    pub recent_releases: Vec<ReleaseRecord>,
}

/// Compute the summary view. Pure: same history, same view.
pub fn summary(history: &History) -> SummaryView {
    let runs = &history.runs;
    let recent_start = runs.len().saturating_sub(RECENT_RUNS);

    SummaryView {
        total_runs: runs.len(),
        successful_runs: runs.iter().filter(|r| r.status == RunStatus::Success).count(),
        success_rate: SuccessRate::over(runs),
        recent_success_rate: SuccessRate::over(&runs[recent_start..]),
        last_run_at: runs.last().map(|r| r.finished_at),
        last_release_at: history.releases.last().map(|r| r.published_at),
        total_releases: history.releases.len(),
        recent_runs: runs.iter().rev().take(RECENT_RUNS).cloned().collect(),
        recent_releases: history
            .releases
            .iter()
            .rev()
            .take(RECENT_RELEASES)
            .cloned()
            .collect(),
    }
}

impl SummaryView {
    /// Plain-text rendering for the CLI.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{:=<60}\n", ""));
        out.push_str("PIPELINE STATUS SUMMARY\n");
        out.push_str(&format!("{:=<60}\n", ""));
        out.push_str(&format!("Total Runs:          {}\n", self.total_runs));
        out.push_str(&format!("Successful Runs:     {}\n", self.successful_runs));
        out.push_str(&format!("Success Rate:        {}\n", self.success_rate));
        out.push_str(&format!("Recent Success Rate: {}\n", self.recent_success_rate));
        out.push_str(&format!(
            "Last Run:            {}\n",
            self.last_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "Never".into())
        ));
        out.push_str(&format!(
            "Last Release:        {}\n",
            self.last_release_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "Never".into())
        ));
        out.push_str(&format!("Total Releases:      {}\n", self.total_releases));

        if let Some(latest) = self.recent_releases.first() {
            out.push_str(&format!(
                "Latest Release:      {} ({:.1} MB, {} item(s))\n",
                latest.release_id,
                latest.total_size_mb(),
                latest.item_count()
            ));
        }

        if !self.recent_runs.is_empty() {
            out.push_str("\nRecent runs:\n");
            out.push_str(&format!(
                "{:<20} | {:<13} | {:<8} | {:>9} | Release\n",
                "Finished", "Trigger", "Status", "OK/Total"
            ));
            out.push_str(&format!("{:-<20}-|-{:-<13}-|-{:-<8}-|-{:-<9}-|-{:-<8}\n", "", "", "", "", ""));
            for run in &self.recent_runs {
                out.push_str(&format!(
                    "{:<20} | {:<13} | {:<8} | {:>9} | {}\n",
                    run.finished_at.format("%Y-%m-%d %H:%M:%S"),
                    run.trigger.to_string(),
                    run.status.to_string(),
                    format!("{}/{}", run.items.succeeded, run.items.attempted),
                    run.release_id.as_deref().unwrap_or("-"),
                ));
            }
        }
        out
    }
}
