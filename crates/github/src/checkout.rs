//! Shallow checkouts of the branch under review.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use scanrelay_core::models::JobContext;
use tempfile::TempDir;
use tokio::process::Command;
use url::Url;

pub const DEFAULT_CLONE_BASE: &str = "https://github.com/";

/// Web root that repositories are cloned from. GitHub Enterprise serves its API under
/// `/api/v3` on the same host as the repositories.
pub fn clone_base(api_url: Option<&Url>) -> Result<Url> {
    let default = || Url::parse(DEFAULT_CLONE_BASE).context("Invalid clone base");
    let Some(api_url) = api_url else {
        return default();
    };
    match api_url.host_str() {
        None | Some("api.github.com") => default(),
        Some(_) => {
            let mut base = api_url.clone();
            base.set_path("/");
            base.set_query(None);
            base.set_fragment(None);
            Ok(base)
        }
    }
}

/// Source tree of a job. The directory is removed when this is dropped.
#[derive(Debug)]
pub struct Checkout {
    dir: TempDir,
}

impl Checkout {
    pub fn new(dir: TempDir) -> Self { Self { dir } }

    pub fn path(&self) -> &Path { self.dir.path() }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, context: &JobContext) -> Result<Checkout>;
}

/// Clones repositories with the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCheckout {
    base_url: Url,
    token: Option<String>,
    work_dir: Option<PathBuf>,
}

impl GitCheckout {
    pub fn new(base_url: Url, token: Option<String>, work_dir: Option<PathBuf>) -> Self {
        Self { base_url, token, work_dir }
    }

    /// Clone URL with the token embedded as basic-auth credentials.
    fn clone_url(&self, owner: &str, name: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("{owner}/{name}.git"))
            .with_context(|| format!("Invalid repository {owner}/{name}"))?;
        if let Some(token) = &self.token {
            url.set_username("x-access-token")
                .and_then(|_| url.set_password(Some(token)))
                .map_err(|_| anyhow::anyhow!("Cannot set credentials on {}", self.base_url))?;
        }
        Ok(url)
    }

    fn redact(&self, message: &str) -> String {
        match &self.token {
            Some(token) if !token.is_empty() => message.replace(token.as_str(), "***"),
            _ => message.to_string(),
        }
    }
}

#[async_trait]
impl SourceFetcher for GitCheckout {
    async fn fetch(&self, context: &JobContext) -> Result<Checkout> {
        let prefix = format!("scan-{}-{}-", context.repo_owner, context.repo_name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.work_dir {
            Some(work_dir) => builder.tempdir_in(work_dir),
            None => builder.tempdir(),
        }
        .context("Failed to create checkout directory")?;
        let url = self.clone_url(&context.repo_owner, &context.repo_name)?;

        tracing::info!("Cloning {} branch={}", context.full_name(), context.branch);
        let output = Command::new("git")
            .arg("clone")
            .arg("--quiet")
            .arg("--depth")
            .arg("1")
            .arg("--branch")
            .arg(&context.branch)
            .arg(url.as_str())
            .arg(dir.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run git")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Git clone failed: {}", self.redact(stderr.trim()));
        }
        tracing::info!("Repository cloned to {}", dir.path().display());
        Ok(Checkout::new(dir))
    }
}
