//! Transform stage: run the configured external tool on a fetched artifact.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::workspace::Workspace;
use crate::config::TransformConfig;
use crate::pipeline::{Diagnostic, Stage, StageExecutor, StageOutcome, WorkItem};

/// Lines of stderr kept in a failure diagnostic.
const STDERR_TAIL_LINES: usize = 20;

pub struct CommandTransformer {
    config: TransformConfig,
    workspace: Workspace,
}

impl CommandTransformer {
    pub fn new(config: TransformConfig, workspace: Workspace) -> Self {
        Self { config, workspace }
    }

    /// Full argument list for `item`: configured args with placeholders
    /// expanded, then per-item enable/disable flags, then passthrough args.
    pub fn build_args(&self, item: &WorkItem, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();

        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| {
                a.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{name}", &item.name)
                    .replace("{target}", &item.target)
            })
            .collect();

        for patch in &item.options.enable {
            args.push(self.config.enable_flag.clone());
            args.push(patch.clone());
        }
        for patch in &item.options.disable {
            args.push(self.config.disable_flag.clone());
            args.push(patch.clone());
        }
        args.extend(item.options.args.iter().cloned());
        args
    }

    pub fn log_path(&self, item: &WorkItem) -> PathBuf {
        self.config.log_dir.join(format!("{}-transform.log", item.name))
    }

    async fn transform(&self, item: &WorkItem) -> Result<std::result::Result<PathBuf, Diagnostic>> {
        let input = self.workspace.fetched_path(item);
        if !input.exists() {
            return Ok(Err(Diagnostic::new(format!(
                "fetched artifact not found: {}",
                input.display()
            ))));
        }
        let output = self.workspace.output_path(item);
        for dir in [output.parent(), Some(self.config.log_dir.as_path())].into_iter().flatten() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        // A leftover from an earlier run must not pass the output check below.
        match tokio::fs::remove_file(&output).await {
            Ok(()) => debug!(item = %item.name, path = %output.display(), "Removed stale output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove stale {}", output.display()))
            }
        }

        let args = self.build_args(item, &input, &output);
        debug!(item = %item.name, program = %self.config.program, ?args, "Spawning transform");

        let result = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.config.program))?;

        self.append_log(item, &args, &result).await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let mut diagnostic = Diagnostic::new(format!("{} exited unsuccessfully", self.config.program))
                .with_detail(tail(&stderr, STDERR_TAIL_LINES));
            if let Some(code) = result.status.code() {
                diagnostic = diagnostic.with_exit_code(code);
            }
            return Ok(Err(diagnostic));
        }
        if !output.exists() {
            return Ok(Err(Diagnostic::new(format!(
                "{} succeeded but produced no output at {}",
                self.config.program,
                output.display()
            ))));
        }
        Ok(Ok(output))
    }

    async fn append_log(&self, item: &WorkItem, args: &[String], result: &std::process::Output) -> Result<()> {
        let path = self.log_path(item);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open log {}", path.display()))?;

        let header = format!(
            "=== {} {} {}\n--- exit: {}\n",
            Utc::now().to_rfc3339(),
            self.config.program,
            args.join(" "),
            result.status
        );
        file.write_all(header.as_bytes()).await?;
        file.write_all(b"--- stdout\n").await?;
        file.write_all(&result.stdout).await?;
        file.write_all(b"\n--- stderr\n").await?;
        file.write_all(&result.stderr).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait::async_trait]
impl StageExecutor for CommandTransformer {
    async fn execute(&self, item: &WorkItem) -> StageOutcome {
        let started = Instant::now();
        match self.transform(item).await {
            Ok(Ok(output)) => {
                info!(item = %item.name, output = %output.display(), "Transformed artifact");
                StageOutcome::success(Stage::Transform, started.elapsed())
            }
            Ok(Err(diagnostic)) => StageOutcome::failed(Stage::Transform, diagnostic, started.elapsed()),
            Err(e) => StageOutcome::failed(
                Stage::Transform,
                Diagnostic::new(format!("{:#}", e)),
                started.elapsed(),
            ),
        }
    }
}
