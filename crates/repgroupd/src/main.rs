//! repgroupd - replication group membership daemon

use anyhow::{Context, Result};
use clap::Parser;
use repgroupd::config::{Config, CONFIG_PATH};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repgroupd", version, about = "Replication group membership daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("repgroupd v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load_from_path(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    repgroupd::daemon::run(config).await?;

    info!("Shutting down gracefully");
    Ok(())
}
