use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use argp::FromArgs;
use scanrelay_core::{config::Config, models::ScannerKind};
use scanrelay_github::{
    GitHub,
    checkout::{GitCheckout, clone_base},
};
use scanrelay_jobs::{HttpNotifier, Worker, WorkerContext, connect_with_backoff, run_supervised};
use scanrelay_scanners::scanner_for;
use scanrelay_store::RedisBroker;

use crate::util::{scanner_kind, shutdown_signal};

#[derive(FromArgs, PartialEq, Debug)]
/// Consume one scanner class's stream and report the results.
#[argp(subcommand, name = "worker")]
pub struct Args {
    #[argp(option, short = 's', from_str_fn(scanner_kind))]
    /// scanner class to host (kics, blackduck)
    scanner: ScannerKind,
    #[argp(switch)]
    /// exit after the first message has been handled
    once: bool,
    #[argp(option)]
    /// consumer name within the group, unique per process (defaults to a generated name)
    consumer: Option<String>,
}

pub async fn run(config: Config, args: &Args) -> Result<()> {
    let config = Arc::new(config);
    let scanner = scanner_for(args.scanner, &config.scanners);
    let version = scanner
        .check_installed()
        .await
        .with_context(|| format!("{} is not available", args.scanner.display_name()))?;
    tracing::info!("{} version: {}", args.scanner.display_name(), version);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let connect = || RedisBroker::connect(&config.redis);
    let Some(broker) =
        connect_with_backoff(connect, config.worker.max_backoff(), shutdown.as_mut()).await
    else {
        tracing::info!("Shutdown requested before Redis became available");
        return Ok(());
    };
    let broker = Arc::new(broker);
    let reporter = GitHub::new(&config.github).await?;
    let source = Arc::new(GitCheckout::new(
        clone_base(config.github.api_url.as_ref())?,
        config.github.token.clone(),
        config.worker.work_dir.as_ref().map(PathBuf::from),
    ));
    let notifier = Arc::new(HttpNotifier::new(config.callbacks.timeout())?);
    let ctx = WorkerContext {
        config: config.clone(),
        contexts: broker.clone(),
        queue: broker,
        scanner,
        source,
        reporter,
        notifier,
    };
    let mut worker = Worker::new(ctx);
    if let Some(consumer) = &args.consumer {
        worker = worker.with_consumer(consumer.clone());
    }
    run_supervised(Arc::new(worker), config.worker.max_backoff(), args.once, shutdown).await
}
