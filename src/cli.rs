//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Iwill public feed tooling
#[derive(Parser, Debug)]
#[command(name = "iwill")]
#[command(version)]
#[command(about = "Replay change scripts through the Iwill feed engine")]
#[command(
    long_about = "Drives the public will feed and the unread notification counter from a snapshot and a JSON-lines change script, the same way the live page applies realtime notices."
)]
pub struct Cli {
    /// Config file (TOML, or JSON with a .json extension)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a change script against an initial feed snapshot
    Replay {
        /// JSON array of will records, or "-" to simulate a failed load
        #[arg(short, long)]
        snapshot: String,

        /// JSON-lines change script
        #[arg(short, long)]
        events: PathBuf,

        /// Print the final feed as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Replay notification notices through the unread counter
    Unread {
        /// Signed-in user id
        #[arg(long)]
        viewer: String,

        /// Unread count returned by the initial query
        #[arg(long, default_value_t = 0)]
        initial: u64,

        /// JSON-lines change script
        #[arg(short, long)]
        events: PathBuf,
    },
}
