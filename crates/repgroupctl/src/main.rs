//! repgroupctl - operator tool for replication group membership

use anyhow::Result;
use clap::Parser;
use repgroupctl::cli::{Cli, Commands};
use repgroupctl::commands;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let output = match cli.command {
        Commands::Versions { json } => commands::versions(json)?,
        Commands::Decode { hex, target, json } => commands::decode(&hex, target, json)?,
        Commands::Check { stream, format } => commands::check(stream, format)?,
        Commands::Convert { hex, to } => commands::convert(&hex, to)?,
        Commands::Status { addr, config, json } => commands::status(&addr, config.as_deref(), json).await?,
    };

    println!("{}", output.trim_end());
    Ok(())
}
