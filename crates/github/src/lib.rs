pub mod checkout;
pub mod report;
pub mod webhook;

use std::{
    future::Future,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use octocrab::Octocrab;
use regex::Regex;
use scanrelay_core::config::GitHubConfig;
use serde::Deserialize;

use crate::report::{CheckRunUpdate, NewCheckRun};

/// Repository a report is posted to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self { owner: owner.into(), name: name.into() }
    }
}

/// Outbound calls to the repository host. Each call is independent; callers log failures and
/// carry on.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn post_comment(&self, repo: &RepoRef, pull_request: u64, body: &str) -> Result<()>;

    /// Creates a completed check run and returns its id.
    async fn create_check_run(&self, repo: &RepoRef, check_run: &NewCheckRun) -> Result<u64>;

    async fn update_check_run(
        &self,
        repo: &RepoRef,
        check_run_id: u64,
        update: &CheckRunUpdate,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
    timeout: Duration,
}

#[derive(Deserialize)]
struct CheckRunResponse {
    id: u64,
}

impl GitHub {
    pub async fn new(config: &GitHubConfig) -> Result<Arc<Self>> {
        let mut builder = Octocrab::builder()
            .set_connect_timeout(Some(config.timeout()))
            .set_read_timeout(Some(config.timeout()))
            .set_write_timeout(Some(config.timeout()));
        if let Some(api_url) = &config.api_url {
            builder = builder.base_uri(api_url.as_str()).context("Invalid GitHub API URL")?;
        }
        let client = match &config.token {
            Some(token) => builder.personal_token(token.clone()).build(),
            None => builder.build(),
        }
        .context("Failed to create GitHub client")?;
        if config.token.is_some() {
            match client.current().user().await {
                Ok(profile) => tracing::info!("Logged in as {}", profile.login),
                Err(e) => tracing::warn!("Failed to fetch current user: {}", e),
            }
        } else {
            tracing::warn!("No GitHub token configured, reports will not be posted");
        }
        Ok(Arc::new(Self { client, timeout: config.timeout() }))
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        fut: impl Future<Output = octocrab::Result<T>> + Send,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", what, self.timeout))?
            .with_context(|| format!("Failed to {what}"))
    }
}

#[async_trait]
impl Reporter for GitHub {
    async fn post_comment(&self, repo: &RepoRef, pull_request: u64, body: &str) -> Result<()> {
        let issues = self.client.issues(&repo.owner, &repo.name);
        let comment =
            self.with_timeout("post PR comment", issues.create_comment(pull_request, body)).await?;
        tracing::info!(
            "Posted comment {} on {}/{}#{}",
            comment.id,
            repo.owner,
            repo.name,
            pull_request
        );
        Ok(())
    }

    async fn create_check_run(&self, repo: &RepoRef, check_run: &NewCheckRun) -> Result<u64> {
        let route = format!("/repos/{}/{}/check-runs", repo.owner, repo.name);
        let response: CheckRunResponse = self
            .with_timeout("create check run", self.client.post(route, Some(check_run)))
            .await?;
        tracing::info!(
            "Created check run {} on {}/{} ({})",
            response.id,
            repo.owner,
            repo.name,
            check_run.conclusion
        );
        Ok(response.id)
    }

    async fn update_check_run(
        &self,
        repo: &RepoRef,
        check_run_id: u64,
        update: &CheckRunUpdate,
    ) -> Result<()> {
        let route = format!("/repos/{}/{}/check-runs/{}", repo.owner, repo.name, check_run_id);
        let _: CheckRunResponse = self
            .with_timeout("update check run", self.client.patch(route, Some(update)))
            .await?;
        tracing::debug!(
            "Added {} annotations to check run {}",
            update.output.annotations.len(),
            check_run_id
        );
        Ok(())
    }
}

/// Extract the owner and repository name from a GitHub repository URL.
pub fn extract_github_url(url: &str) -> Option<(&str, &str)> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let caps = REGEX
        .get_or_init(|| {
            Regex::new(r"^https?://github\.com/(?P<owner>[^/]+)/(?P<repo>[^/]+?)(?:\.git)?(?:/|$)")
                .unwrap()
        })
        .captures(url)?;
    let owner = caps.name("owner").map(|m| m.as_str()).unwrap_or_default();
    let repo = caps.name("repo").map(|m| m.as_str()).unwrap_or_default();
    Some((owner, repo))
}
