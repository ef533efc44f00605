//! Fetch stage: bring the source artifact into the downloads directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::{debug, info};

use super::workspace::Workspace;
use crate::pipeline::{Diagnostic, Stage, StageExecutor, StageOutcome, WorkItem};

/// Downloads `http(s)://` sources and copies `file://` or plain-path sources.
pub struct HttpFetcher {
    client: Client,
    workspace: Workspace,
}

impl HttpFetcher {
    pub fn new(workspace: Workspace) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("patchline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, workspace })
    }

    async fn fetch(&self, item: &WorkItem) -> Result<(PathBuf, u64)> {
        let dest = self.workspace.fetched_path(item);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let bytes = if item.source.starts_with("http://") || item.source.starts_with("https://") {
            self.download(&item.source, &dest).await?
        } else {
            let src = item.source.strip_prefix("file://").unwrap_or(&item.source);
            copy_local(Path::new(src), &dest).await?
        };
        Ok((dest, bytes))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        debug!(%url, "Downloading");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("download of {} failed with HTTP {}", url, status);
        }

        let body = response.bytes().await.context("Failed to read response body")?;
        if body.is_empty() {
            anyhow::bail!("download of {} returned an empty body", url);
        }
        tokio::fs::write(dest, &body)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        Ok(body.len() as u64)
    }
}

async fn copy_local(src: &Path, dest: &Path) -> Result<u64> {
    if src == dest {
        let meta = tokio::fs::metadata(src)
            .await
            .with_context(|| format!("Source artifact missing: {}", src.display()))?;
        return Ok(meta.len());
    }
    tokio::fs::copy(src, dest)
        .await
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))
}

#[async_trait::async_trait]
impl StageExecutor for HttpFetcher {
    async fn execute(&self, item: &WorkItem) -> StageOutcome {
        let started = Instant::now();
        match self.fetch(item).await {
            Ok((path, bytes)) => {
                info!(item = %item.name, path = %path.display(), bytes, "Fetched artifact");
                StageOutcome::success(Stage::Fetch, started.elapsed())
            }
            Err(e) => StageOutcome::failed(
                Stage::Fetch,
                Diagnostic::new(format!("{:#}", e)),
                started.elapsed(),
            ),
        }
    }
}
