//! Pipeline core -- stage sequencing, retry policy, run records, summaries.

pub mod executor;
pub mod orchestrator;
pub mod record;
pub mod retry;
pub mod summary;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::HistoryError;

pub use self::executor::{FailureReporter, PublishReceipt, PublishedAsset, Publisher, StageExecutor};
pub use self::orchestrator::{Collaborators, Orchestrator, Settings};
pub use self::record::{ReleaseRecord, RunRecord, RunStatus};
pub use self::retry::RetryPolicy;
pub use self::summary::{summary, SummaryView};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid work items: {0}")]
    InvalidItems(String),

    #[error("run {} completed with unsaved state: {source}", .record.run_id)]
    HistoryUnsaved {
        record: Box<RunRecord>,
        #[source]
        source: HistoryError,
    },

    #[error("run {} was saved but its release record is unsaved: {source}", .record.run_id)]
    ReleaseUnsaved {
        record: Box<RunRecord>,
        #[source]
        source: HistoryError,
    },

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Tool-specific flags for a work item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemOptions {
    /// Patches/features to force on.
    pub enable: Vec<String>,
    /// Patches/features to force off.
    pub disable: Vec<String>,
    /// Extra arguments passed through verbatim.
    pub args: Vec<String>,
}

/// One unit of work flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub name: String,
    /// Where the source artifact comes from (URL or local path).
    pub source: String,
    /// Identifier of the thing being built, e.g. a package id.
    pub target: String,
    #[serde(default)]
    pub options: ItemOptions,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl WorkItem {
    pub fn new(name: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            options: ItemOptions::default(),
            enabled: true,
        }
    }
}

/// Per-item stages. Publish is run-level and never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Transform,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetch => write!(f, "fetch"),
            Stage::Transform => write!(f, "transform"),
        }
    }
}

/// Why a run started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Schedule,
    Manual,
    ConfigChange,
}

impl TriggerKind {
    /// Map a CI event name onto a trigger kind.
    pub fn from_ci_event(event: Option<&str>) -> Self {
        match event {
            Some("schedule") => TriggerKind::Schedule,
            Some("push") => TriggerKind::ConfigChange,
            _ => TriggerKind::Manual,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Schedule => write!(f, "schedule"),
            TriggerKind::Manual => write!(f, "manual"),
            TriggerKind::ConfigChange => write!(f, "config_change"),
        }
    }
}

/// Fixed-shape failure detail carried by a failed stage outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
            detail: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {})", code)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed { diagnostic: Diagnostic },
    Skipped { reason: String },
}

/// Result of running one stage for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    /// Attempts made, filled in by the retry loop.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl StageOutcome {
    pub fn success(stage: Stage, elapsed: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            attempts: 1,
            elapsed,
        }
    }

    pub fn failed(stage: Stage, diagnostic: Diagnostic, elapsed: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::Failed { diagnostic },
            attempts: 1,
            elapsed,
        }
    }

    pub fn skipped(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped {
                reason: reason.into(),
            },
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, StageStatus::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, StageStatus::Failed { .. })
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match &self.status {
            StageStatus::Failed { diagnostic } => Some(diagnostic),
            _ => None,
        }
    }
}

/// Who or what invoked the run. All fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}
