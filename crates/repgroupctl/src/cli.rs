//! CLI - Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Replication group operator tool
#[derive(Parser)]
#[command(name = "repgroupctl")]
#[command(about = "Inspect replication group membership streams and version compatibility", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show supported format and stream versions and the compatibility matrix
    Versions {
        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Decode a membership hex stream
    Decode {
        /// Hex token stream
        hex: String,

        /// Declare the decoded group at this format version
        #[arg(long)]
        target: Option<u16>,

        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Check whether a peer stream version may join a group of a given format
    Check {
        /// Peer stream protocol version
        #[arg(long)]
        stream: u32,

        /// Local group format version
        #[arg(long)]
        format: u16,
    },

    /// Re-encode a membership hex stream at another format version
    Convert {
        /// Hex token stream
        hex: String,

        /// Target format version
        #[arg(long)]
        to: u16,
    },

    /// Query a running daemon's status
    Status {
        /// Daemon address (host:port)
        #[arg(long)]
        addr: String,

        /// Daemon configuration to take channel settings from
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output JSON only
        #[arg(long)]
        json: bool,
    },
}
