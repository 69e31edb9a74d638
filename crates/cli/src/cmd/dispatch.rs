use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use argp::FromArgs;
use scanrelay_core::{config::Config, models::TriggerEvent, util::UrlExt};
use scanrelay_github::extract_github_url;
use scanrelay_jobs::Dispatcher;
use scanrelay_store::RedisBroker;

#[derive(FromArgs, PartialEq, Debug)]
/// Submit a scan job directly to the broker.
#[argp(subcommand, name = "dispatch")]
pub struct Args {
    #[argp(option, short = 'r')]
    /// repository URL or owner/name
    repo: String,
    #[argp(option, short = 'b')]
    /// branch to scan
    branch: String,
    #[argp(option, default = "0")]
    /// pull request number (0 skips the comment)
    pr: u64,
    #[argp(option, default = "String::new()")]
    /// head commit SHA (empty skips the check run)
    sha: String,
    #[argp(option)]
    /// callback URL (defaults to the configured public URL)
    callback_url: Option<String>,
}

/// Splits a repository argument into owner and name.
fn parse_repo(repo: &str) -> Option<(&str, &str)> {
    if let Some(parsed) = extract_github_url(repo) {
        return Some(parsed);
    }
    let (owner, name) = repo.trim_end_matches('/').split_once('/')?;
    if owner.is_empty() || name.is_empty() || name.contains('/') || owner.contains(':') {
        return None;
    }
    Some((owner, name))
}

pub async fn run(config: Config, args: &Args) -> Result<()> {
    let (owner, name) =
        parse_repo(&args.repo).ok_or_else(|| anyhow!("Invalid repository: {}", args.repo))?;
    let event = TriggerEvent {
        repo_owner: owner.to_string(),
        repo_name: name.to_string(),
        branch: args.branch.clone(),
        pull_request_id: args.pr,
        commit_sha: args.sha.clone(),
        installation_id: None,
    };
    let callback_url = match (&args.callback_url, &config.server.public_url) {
        (Some(url), _) => url.clone(),
        (None, Some(public_url)) => public_url.with_path("/callback").to_string(),
        (None, None) => {
            tracing::warn!("No callback URL configured, workers will not send callbacks");
            String::new()
        }
    };

    let broker =
        Arc::new(RedisBroker::connect(&config.redis).await.context("Failed to connect to Redis")?);
    let dispatcher = Dispatcher::new(broker.clone(), broker, config.dispatch.clone());
    let receipt = dispatcher.submit(event, &callback_url).await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    if receipt.enqueued.is_empty() {
        anyhow::bail!("No scanner accepted job {}", receipt.id);
    }
    Ok(())
}
