//! TOML configuration: work items, run settings, and collaborator wiring.
//!
//! Every section has defaults, so a file only needs the parts it changes.
//! The file path comes from `--config`, then `PATCHLINE_CONFIG`, then
//! `patchline.toml` in the working directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::history::{HistoryStore, JsonHistory, SqliteHistory};
use crate::pipeline::{RetryPolicy, Settings, WorkItem};

pub const CONFIG_ENV: &str = "PATCHLINE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "patchline.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub items: Vec<WorkItem>,
}

impl PipelineConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), items = config.items.len(), "loaded pipeline configuration");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load) but falls back to defaults when the file
    /// does not exist. A file that exists but is broken is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no config file found, using compiled-in defaults");
            Ok(Self::default())
        }
    }

    /// Find the configuration for a command-line invocation.
    ///
    /// An explicit path or `PATCHLINE_CONFIG` must exist. Without either,
    /// `patchline.toml` is used when present and defaults otherwise.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::load(Path::new(&path)),
            _ => Self::load_or_default(Path::new(DEFAULT_CONFIG_PATH)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.name.trim().is_empty() {
                anyhow::bail!("work item with source '{}' has an empty name", item.source);
            }
            if !seen.insert(item.name.as_str()) {
                anyhow::bail!("duplicate work item name '{}'", item.name);
            }
            if item.source.trim().is_empty() {
                anyhow::bail!("work item '{}' has an empty source", item.name);
            }
        }
        if self.settings.concurrency == 0 {
            anyhow::bail!("settings.concurrency must be at least 1");
        }
        if self.settings.max_retry_delay_secs < self.settings.retry_delay_secs {
            warn!(
                retry_delay_secs = self.settings.retry_delay_secs,
                max_retry_delay_secs = self.settings.max_retry_delay_secs,
                "max_retry_delay_secs is below retry_delay_secs; every retry will wait the maximum"
            );
        }
        Ok(())
    }

    /// The items a run should process.
    pub fn enabled_items(&self) -> Vec<WorkItem> {
        self.items.iter().filter(|i| i.enabled).cloned().collect()
    }

    pub fn open_history(&self) -> Result<Arc<dyn HistoryStore>> {
        self.history.open()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Retry and timeout settings for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Retries after the first attempt for fetch and transform. 0 = no retry.
    pub max_retries: u32,
    /// File a failure report for each item that failed.
    pub report_on_failure: bool,
    /// Delay before the first retry; doubles per attempt.
    pub retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    /// Items processed concurrently.
    pub concurrency: usize,
    /// Per-attempt limit for fetch and transform.
    pub stage_timeout_secs: u64,
    /// Limit for one publish or report call.
    pub collaborator_timeout_secs: u64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            report_on_failure: true,
            retry_delay_secs: 5,
            max_retry_delay_secs: 60,
            concurrency: 1,
            stage_timeout_secs: 600,
            collaborator_timeout_secs: 300,
        }
    }
}

impl SettingsConfig {
    pub fn to_settings(&self) -> Settings {
        Settings {
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_secs(self.retry_delay_secs),
                Duration::from_secs(self.max_retry_delay_secs),
            ),
            report_on_failure: self.report_on_failure,
            concurrency: self.concurrency.max(1),
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            collaborator_timeout: Duration::from_secs(self.collaborator_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryBackend {
    Sqlite,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub backend: HistoryBackend,
    /// SQLite database file (sqlite backend).
    pub database: PathBuf,
    /// Directory holding the history JSON files (json backend).
    pub dir: PathBuf,
}

impl HistoryConfig {
    /// Open the configured backend, creating files and directories as needed.
    pub fn open(&self) -> Result<Arc<dyn HistoryStore>> {
        let store: Arc<dyn HistoryStore> = match self.backend {
            HistoryBackend::Sqlite => Arc::new(
                SqliteHistory::open(&self.database)
                    .with_context(|| format!("failed to open history database {}", self.database.display()))?,
            ),
            HistoryBackend::Json => Arc::new(JsonHistory::new(self.dir.clone())),
        };
        debug!(backend = ?self.backend, "history store opened");
        Ok(store)
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::Sqlite,
            database: PathBuf::from("logs/patchline.db"),
            dir: PathBuf::from("logs"),
        }
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// On-disk layout shared by the fetch, transform and publish stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub downloads_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Inserted before the extension of transformed artifacts.
    pub output_suffix: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("downloads"),
            output_dir: PathBuf::from("output"),
            output_suffix: "-patched".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// The external tool run for every fetched artifact.
///
/// `{input}`, `{output}`, `{name}` and `{target}` are substituted in `args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub program: String,
    pub args: Vec<String>,
    pub enable_flag: String,
    pub disable_flag: String,
    /// Directory for per-item tool logs.
    pub log_dir: PathBuf,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            program: "java".to_string(),
            args: vec![
                "-jar".into(),
                "tools/cli.jar".into(),
                "patch".into(),
                "-p".into(),
                "tools/patches.rvp".into(),
                "-o".into(),
                "{output}".into(),
                "{input}".into(),
            ],
            enable_flag: "--enable".to_string(),
            disable_flag: "--disable".to_string(),
            log_dir: PathBuf::from("output/logs"),
        }
    }
}

// ---------------------------------------------------------------------------
// Publish / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishKind {
    Github,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub kind: PublishKind,
    /// Tag is `<tag_prefix>-YYYY-MM-DD`.
    pub tag_prefix: String,
    /// Destination for the local publisher.
    pub releases_dir: PathBuf,
    pub github: GithubConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            kind: PublishKind::Local,
            tag_prefix: "patched".to_string(),
            releases_dir: PathBuf::from("releases"),
            github: GithubConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Github,
    Local,
    /// Failures are only logged and recorded in history.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub kind: ReportKind,
    /// Destination for the local reporter.
    pub reports_dir: PathBuf,
    pub labels: Vec<String>,
    pub github: GithubConfig,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            kind: ReportKind::Local,
            reports_dir: PathBuf::from("logs/reports"),
            labels: vec!["pipeline-failure".to_string()],
            github: GithubConfig::default(),
        }
    }
}

/// GitHub API coordinates. Credentials are read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    /// `owner/name`; falls back to `GITHUB_REPOSITORY`.
    pub repository: Option<String>,
    pub token_env: String,
    pub api_url: String,
    pub uploads_url: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            repository: None,
            token_env: "GITHUB_TOKEN".to_string(),
            api_url: "https://api.github.com".to_string(),
            uploads_url: "https://uploads.github.com".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Cron expressions (`sec min hour day month weekday`) for `serve`.
    pub cron: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: vec!["0 0 6 * * *".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
