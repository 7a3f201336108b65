//! # trust-cli
//!
//! CLI tool for exercising 0k-Trust.
//!
//! ## Commands
//!
//! - `simulate`: Form a circle of several devices over an in-memory relay
//! - `status`: Show the persisted state of an account
//!
//! ## Example
//!
//! ```bash
//! # Three devices, first one persisted to disk, then rotate a view
//! trust-cli simulate --devices 3 --database trust.db --rotate passwords
//!
//! # Inspect what the first device saved
//! trust-cli status --database trust.db --account alice
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{simulate, status};

/// CLI tool for exercising 0k-Trust.
#[derive(Parser, Debug)]
#[command(name = "trust-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log engine activity at debug level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Form a circle of several devices over an in-memory relay
    Simulate {
        /// Number of devices
        #[arg(long, short, default_value = "2")]
        devices: usize,

        /// Engine configuration file (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Account identifier
        #[arg(long, default_value = "alice")]
        account: String,

        /// Persist the first device to this SQLite database
        #[arg(long)]
        database: Option<PathBuf>,

        /// Rotate this view once the circle has formed
        #[arg(long)]
        rotate: Option<String>,
    },

    /// Show the persisted state of an account
    Status {
        /// SQLite database written by an engine
        #[arg(long)]
        database: PathBuf,

        /// Account to show (lists accounts if omitted)
        #[arg(long)]
        account: Option<String>,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Simulate {
            devices,
            config,
            account,
            database,
            rotate,
        } => {
            let options = simulate::Options {
                devices,
                config,
                account,
                database,
                rotate,
            };
            simulate::run(options).await?;
        }
        Commands::Status {
            database,
            account,
            json,
        } => {
            status::run(&database, account.as_deref(), json).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
