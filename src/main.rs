use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::error;

use taskboard_sync::commands::{self, Command};
use taskboard_sync::{config, AppContext};

#[derive(Debug, Parser)]
#[command(author, version, about = "Task board client: session, tasks and notifications")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let ctx = AppContext::connect(&cfg).await?;

    if let Err(err) = commands::run(&ctx, args.command, cfg.app.poll_interval()).await {
        error!(?err, "command failed");
        return Err(err);
    }
    Ok(())
}
