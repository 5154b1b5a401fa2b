//! # ragsync CLI
//!
//! Operator commands for the local stores behind a ragsync deployment.
//!
//! ## Usage
//!
//! ```bash
//! ragsync --config ./config/ragsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragsync init` | Create the SQLite database and run schema migrations |
//! | `ragsync stats` | Count bots, documents, chunks, and key-value entries |
//! | `ragsync partitions` | Show which partitions are tracked as loaded |
//! | `ragsync purge` | Delete expired key-value entries |
//! | `ragsync config` | Validate and print the effective configuration |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ragsync::{config, migrate, stats};

/// ragsync: partition lifecycle, debounced flushing, and compensated writes
/// for a retrieval-augmented generation backend.
#[derive(Parser)]
#[command(name = "ragsync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again leaves existing data alone.
    Init,

    /// Show row counts for the relational and key-value stores.
    Stats,

    /// Show tracked partitions, oldest access first in the summary.
    Partitions,

    /// Delete expired key-value entries.
    Purge,

    /// Validate the config file and print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Partitions => {
            stats::run_partitions(&cfg).await?;
        }
        Commands::Purge => {
            stats::run_purge(&cfg).await?;
        }
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&cfg).context("Failed to render configuration")?;
            println!("# {}", cli.config.display());
            print!("{}", rendered);
        }
    }

    Ok(())
}
