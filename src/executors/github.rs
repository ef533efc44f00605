//! GitHub releases and issues over the REST API.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::workspace::Workspace;
use super::{collect_assets, release_tag, report_body, report_title};
use crate::config::GithubConfig;
use crate::pipeline::{FailureReporter, PublishReceipt, Publisher, StageOutcome, WorkItem};

const ASSET_CONTENT_TYPE: &str = "application/vnd.android.package-archive";

#[derive(Debug, Deserialize)]
struct Release {
    id: u64,
    html_url: String,
}

#[derive(Debug, Serialize)]
struct CreateRelease<'a> {
    tag_name: &'a str,
    name: &'a str,
    body: &'a str,
    draft: bool,
    prerelease: bool,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    title: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CreateIssue<'a> {
    title: &'a str,
    body: &'a str,
    labels: &'a [String],
}

#[derive(Debug, Serialize)]
struct CreateComment<'a> {
    body: &'a str,
}

/// Thin authenticated client for one repository.
#[derive(Clone)]
pub struct GithubClient {
    client: Client,
    api_url: String,
    uploads_url: String,
    repository: String,
    token: String,
}

impl GithubClient {
    pub fn new(
        api_url: impl Into<String>,
        uploads_url: impl Into<String>,
        repository: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("patchline/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            uploads_url: uploads_url.into().trim_end_matches('/').to_string(),
            repository: repository.into(),
            token: token.into(),
        })
    }

    /// Repository from config or `GITHUB_REPOSITORY`; token from the
    /// configured environment variable.
    pub fn from_config(config: &GithubConfig) -> Result<Self> {
        let repository = match &config.repository {
            Some(r) => r.clone(),
            None => std::env::var("GITHUB_REPOSITORY")
                .context("no GitHub repository configured and GITHUB_REPOSITORY is unset")?,
        };
        let token = std::env::var(&config.token_env)
            .with_context(|| format!("GitHub token variable {} is unset", config.token_env))?;
        Self::new(&config.api_url, &config.uploads_url, repository, token)
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}{}", self.api_url, self.repository, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn check(response: Response, what: &str) -> Result<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub {} failed ({status}): {body}", what)
        }
    }

    async fn release_by_tag(&self, tag: &str) -> Result<Option<Release>> {
        let response = self
            .authed(self.client.get(self.repo_url(&format!("/releases/tags/{}", tag))))
            .send()
            .await
            .context("Failed to send request")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, "release lookup").await?;
        Ok(Some(response.json().await.context("Failed to parse release")?))
    }

    async fn delete_release(&self, id: u64) -> Result<()> {
        let response = self
            .authed(self.client.delete(self.repo_url(&format!("/releases/{}", id))))
            .send()
            .await
            .context("Failed to send request")?;
        Self::check(response, "release delete").await?;
        Ok(())
    }

    async fn create_release(&self, tag: &str, title: &str, body: &str) -> Result<Release> {
        let request = CreateRelease {
            tag_name: tag,
            name: title,
            body,
            draft: false,
            prerelease: false,
        };
        let response = self
            .authed(self.client.post(self.repo_url("/releases")).json(&request))
            .send()
            .await
            .context("Failed to send request")?;
        let response = Self::check(response, "release create").await?;
        response.json().await.context("Failed to parse release")
    }

    async fn upload_asset(&self, release_id: u64, filename: &str, bytes: Vec<u8>) -> Result<()> {
        let url = format!(
            "{}/repos/{}/releases/{}/assets",
            self.uploads_url, self.repository, release_id
        );
        let response = self
            .authed(
                self.client
                    .post(url)
                    .query(&[("name", filename)])
                    .header(reqwest::header::CONTENT_TYPE, ASSET_CONTENT_TYPE)
                    .body(bytes),
            )
            .send()
            .await
            .context("Failed to send request")?;
        Self::check(response, "asset upload").await?;
        Ok(())
    }

    async fn open_issues(&self, labels: &[String]) -> Result<Vec<Issue>> {
        let mut req = self
            .client
            .get(self.repo_url("/issues"))
            .query(&[("state", "open"), ("per_page", "100")]);
        if !labels.is_empty() {
            req = req.query(&[("labels", labels.join(","))]);
        }
        let response = self.authed(req).send().await.context("Failed to send request")?;
        let response = Self::check(response, "issue list").await?;
        let issues: Vec<Issue> = response.json().await.context("Failed to parse issues")?;
        Ok(issues.into_iter().filter(|i| i.pull_request.is_none()).collect())
    }

    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        let response = self
            .authed(
                self.client
                    .post(self.repo_url(&format!("/issues/{}/comments", number)))
                    .json(&CreateComment { body }),
            )
            .send()
            .await
            .context("Failed to send request")?;
        Self::check(response, "issue comment").await?;
        Ok(())
    }

    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64> {
        let response = self
            .authed(
                self.client
                    .post(self.repo_url("/issues"))
                    .json(&CreateIssue { title, body, labels }),
            )
            .send()
            .await
            .context("Failed to send request")?;
        let response = Self::check(response, "issue create").await?;
        let issue: Issue = response.json().await.context("Failed to parse issue")?;
        Ok(issue.number)
    }
}

/// Publishes one dated release per run, replacing any same-day release.
pub struct GithubPublisher {
    client: GithubClient,
    workspace: Workspace,
    tag_prefix: String,
}

impl GithubPublisher {
    pub fn new(client: GithubClient, workspace: Workspace, tag_prefix: &str) -> Self {
        Self {
            client,
            workspace,
            tag_prefix: tag_prefix.to_string(),
        }
    }
}

fn release_notes(assets: &[crate::pipeline::PublishedAsset]) -> String {
    let mut notes = format!("## Patched builds\n\n**Items:** {}\n\n", assets.len());
    for asset in assets {
        notes.push_str(&format!(
            "- {} (`{}`, {}, {:.1} MB)\n",
            asset.item,
            asset.filename,
            asset.variant,
            crate::pipeline::record::bytes_to_mb(asset.size_bytes)
        ));
    }
    notes
}

#[async_trait::async_trait]
impl Publisher for GithubPublisher {
    async fn publish(&self, items: &[WorkItem]) -> Result<PublishReceipt> {
        let assets = collect_assets(&self.workspace, items);
        if assets.is_empty() {
            anyhow::bail!("none of the {} succeeded item(s) has a transformed artifact", items.len());
        }

        let now = Utc::now();
        let tag = release_tag(&self.tag_prefix, now);
        if let Some(existing) = self.client.release_by_tag(&tag).await? {
            info!(%tag, id = existing.id, "Replacing existing release");
            self.client.delete_release(existing.id).await?;
        }

        let title = format!("Patched Apps - {}", now.format("%B %d, %Y"));
        let published: Vec<_> = assets.iter().map(|(_, a)| a.clone()).collect();
        let release = self
            .client
            .create_release(&tag, &title, &release_notes(&published))
            .await?;
        info!(%tag, url = %release.html_url, "Release created");

        for (path, asset) in &assets {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            debug!(file = %asset.filename, size = asset.size_bytes, "Uploading asset");
            self.client.upload_asset(release.id, &asset.filename, bytes).await?;
        }

        Ok(PublishReceipt {
            release_id: tag,
            url: Some(release.html_url),
            assets: published,
        })
    }
}

/// Files one issue per failing item and stage; repeats become comments.
pub struct GithubIssueReporter {
    client: GithubClient,
    labels: Vec<String>,
}

impl GithubIssueReporter {
    pub fn new(client: GithubClient, labels: Vec<String>) -> Self {
        Self { client, labels }
    }
}

#[async_trait::async_trait]
impl FailureReporter for GithubIssueReporter {
    async fn report(&self, item: &WorkItem, outcome: &StageOutcome) -> Result<bool> {
        let title = report_title(item, outcome);
        let body = report_body(item, outcome);

        let existing = self
            .client
            .open_issues(&self.labels)
            .await?
            .into_iter()
            .find(|i| i.title == title);

        match existing {
            Some(issue) => {
                self.client.comment(issue.number, &body).await?;
                info!(item = %item.name, issue = issue.number, "Commented on existing failure issue");
            }
            None => {
                let number = self.client.create_issue(&title, &body, &self.labels).await?;
                info!(item = %item.name, issue = number, "Opened failure issue");
            }
        }
        Ok(true)
    }
}
