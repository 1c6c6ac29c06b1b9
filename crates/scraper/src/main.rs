//! On-host helper shipped to cluster hosts during collection
//!
//! `scraper scrape` lists the log, config and TSDB files matching a time
//! window and prints them with their sizes as JSON. `scraper insight` prints
//! a snapshot of the machine. Logs go to stderr so stdout stays parseable.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use diag_lib::scrape::{scrape, InsightSnapshot, LogType, ScrapeOptions};
use diag_lib::CollectWindow;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "scraper")]
#[command(about = "Samples diagnostic files on a cluster host")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List files to collect with their sizes
    Scrape {
        /// Glob of log files
        #[arg(long = "log", value_delimiter = ',')]
        log: Vec<String>,

        /// Glob of config files
        #[arg(long = "config", value_delimiter = ',')]
        config: Vec<String>,

        /// Glob of arbitrary files
        #[arg(long = "file", value_delimiter = ',')]
        file: Vec<String>,

        /// Start of the window
        #[arg(short = 'f', long = "from")]
        from: String,

        /// End of the window
        #[arg(short = 't', long = "to")]
        to: String,

        /// Log types to keep
        #[arg(long = "logtype", value_delimiter = ',', default_value = "std")]
        log_types: Vec<LogType>,

        /// Prometheus data directory
        #[arg(long)]
        prometheus: Option<PathBuf>,
    },

    /// Print system information of this host
    Insight,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let output = match cli.command {
        Commands::Scrape {
            log,
            config,
            file,
            from,
            to,
            log_types,
            prometheus,
        } => {
            let window = CollectWindow::parse(&from, &to, Utc::now())
                .context("invalid collection window")?;
            let mut opts = ScrapeOptions::new(window);
            opts.log_globs = log;
            opts.config_globs = config;
            opts.file_globs = file;
            opts.log_types = log_types.into_iter().collect();
            opts.prometheus_dir = prometheus;

            let sample = tokio::task::spawn_blocking(move || scrape(&opts))
                .await
                .context("scrape task panicked")??;
            debug!(bytes = sample.total_size(), "Scrape finished");
            serde_json::to_string(&sample)?
        }
        Commands::Insight => {
            let snapshot = tokio::task::spawn_blocking(InsightSnapshot::collect)
                .await
                .context("insight task panicked")?;
            serde_json::to_string_pretty(&snapshot)?
        }
    };

    println!("{}", output);
    Ok(())
}
