//! # iwill - feed replay entry point
//!
//! Loads configuration, installs tracing and dispatches the CLI commands.
//!
//! ## Configuration
//!
//! `--config FILE` is read first (TOML, or JSON for `.json`); `IWILL_*`
//! environment variables override it. Without a file the defaults apply.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use iwill::cli::{Cli, Commands};
use iwill::iwill_feed::FeedConfig;
use iwill::replay::{failed_load, parse_script, parse_snapshot, replay_feed, replay_unread};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay {
            snapshot,
            events,
            json,
        } => {
            let snapshot = if snapshot == "-" {
                failed_load()
            } else {
                let text = read(Path::new(&snapshot)).await?;
                Ok(parse_snapshot(&text)?)
            };
            let steps = parse_script(&read(&events).await?)?;
            info!(steps = steps.len(), "Replaying feed script");

            let report = replay_feed(&config, snapshot, &steps);
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to encode report")?
                );
            } else {
                print!("{}", report.render_text());
            }
        }
        Commands::Unread {
            viewer,
            initial,
            events,
        } => {
            let steps = parse_script(&read(&events).await?)?;
            let counter = replay_unread(&viewer, initial, &steps);
            println!("unread: {}", counter.count());
            println!(
                "badge: {}",
                counter.badge_label().as_deref().unwrap_or("(hidden)")
            );
        }
    }
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// File settings if given, then environment overrides.
fn load_config(path: Option<&Path>) -> Result<FeedConfig> {
    let config = match path {
        Some(path) => FeedConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
            .with_env(),
        None => FeedConfig::from_env(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn read(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}
