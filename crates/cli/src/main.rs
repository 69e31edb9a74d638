mod cmd;
mod util;

use anyhow::{Context, Result};
use argp::FromArgs;
use scanrelay_core::config::Config;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};
use typed_path::Utf8NativePathBuf;

use crate::util::native_path;

#[derive(FromArgs, PartialEq, Debug)]
/// Security scan dispatcher and workers.
struct TopLevel {
    #[argp(
        option,
        short = 'c',
        default = "Utf8NativePathBuf::from(\"config.yml\")",
        from_str_fn(native_path)
    )]
    /// configuration file
    config: Utf8NativePathBuf,
    #[argp(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
enum SubCommand {
    Worker(cmd::worker::Args),
    Report(cmd::report::Args),
    Dispatch(cmd::dispatch::Args),
}

impl TopLevel {
    fn load_config(&self) -> Result<Config> {
        Config::from_file(self.config.with_platform_encoding())
            .with_context(|| format!("Failed to load configuration from {}", self.config))
    }
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(env_filter),
        )
        .init();

    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    if let Err(e) = run(args).await {
        tracing::error!("{e:?}");
        std::process::exit(1);
    }
}

async fn run(args: TopLevel) -> Result<()> {
    match &args.command {
        SubCommand::Report(report) => cmd::report::run(report),
        SubCommand::Worker(worker) => cmd::worker::run(args.load_config()?, worker).await,
        SubCommand::Dispatch(dispatch) => cmd::dispatch::run(args.load_config()?, dispatch).await,
    }
}
