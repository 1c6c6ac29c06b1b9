//! Cluster diagnostics CLI
//!
//! Collects logs, configs, metrics and host information from a cluster,
//! packages the result and uploads it for analysis.

mod commands;
mod config;
mod logging;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::collect::{CollectArgs, KubeArgs};
use diag_lib::executor::SshBackend;
use output::OutputFormat;
use std::path::PathBuf;

/// Cluster diagnostics collector
#[derive(Parser)]
#[command(name = "diag")]
#[command(author, version, about = "Collect, package and upload cluster diagnostic data", long_about = None)]
pub struct Cli {
    /// SSH implementation used to reach cluster hosts
    #[arg(long, global = true, value_enum, default_value = "builtin")]
    pub ssh: SshKind,

    /// Timeout in seconds for establishing SSH connections
    #[arg(long, global = true, default_value_t = 5)]
    pub ssh_timeout: u64,

    /// Timeout in seconds for a single remote command
    #[arg(long, global = true, default_value_t = 180)]
    pub wait_timeout: u64,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "default")]
    pub format: OutputFormat,

    /// Skip confirmation prompts
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,

    /// Number of tasks run in parallel
    #[arg(long, short = 'c', global = true, default_value_t = 5)]
    pub concurrency: usize,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SshKind {
    Builtin,
    System,
    None,
}

impl From<SshKind> for SshBackend {
    fn from(kind: SshKind) -> Self {
        match kind {
            SshKind::Builtin => SshBackend::Builtin,
            SshKind::System => SshBackend::System,
            SshKind::None => SshBackend::None,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Collect diagnostic data of an orchestrated cluster
    Collect(CollectArgs),

    /// Collect diagnostic data of a data-migration cluster
    Collectdm(CollectArgs),

    /// Collect diagnostic data of a cluster on Kubernetes
    Collectk(KubeArgs),

    /// Package a result directory into a single file
    Package {
        /// Directory produced by a collect run
        dir: PathBuf,

        /// Output file, defaults to `<dir name>.diag`
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Recipient public key or certificate (PEM)
        #[arg(long)]
        cert: Option<PathBuf>,
    },

    /// Extract a package into a directory
    Unpack {
        /// Package file
        package: PathBuf,

        /// RSA private key (PEM) for encrypted packages
        #[arg(long)]
        key: Option<PathBuf>,

        /// Output directory, defaults to the package name without extension
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Upload a package to the analysis service
    Upload {
        /// Package file
        file: PathBuf,

        /// Alias to store the package under
        #[arg(long)]
        alias: Option<String>,

        /// Issue the package relates to
        #[arg(long)]
        issue: Option<String>,

        /// Service endpoint, overrides the configured region
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Download packages from the analysis service
    Download {
        /// Retrieval URL printed by `upload`
        url: Option<String>,

        /// File id
        #[arg(long)]
        uuid: Option<String>,

        /// Download every package stored under an alias
        #[arg(long)]
        alias: Option<String>,

        /// Download every package of a cluster
        #[arg(long)]
        cluster_id: Option<String>,

        /// Service endpoint, overrides the configured region
        #[arg(long)]
        endpoint: Option<String>,

        /// Destination directory
        #[arg(long, short, default_value = ".")]
        output: PathBuf,
    },

    /// Show recently returned upload URLs
    History,

    /// Show or change local configuration
    Config {
        /// Dotted key, e.g. clinic.token
        key: Option<String>,

        /// New value
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let audit = logging::init(cli.format, cli.verbose);

    if let Err(e) = run(&cli, &audit).await {
        match cli.format {
            OutputFormat::Json => {
                eprintln!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
            }
            OutputFormat::Default => output::print_error(&format!("{:#}", e)),
        }
        tracing::error!(error = %format!("{:#}", e), "Command failed");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, audit: &logging::AuditLog) -> Result<()> {
    let home = config::home_dir()?;
    match &cli.command {
        Commands::Collect(args) => commands::collect::collect(cli, &home, audit, args, false).await,
        Commands::Collectdm(args) => commands::collect::collect(cli, &home, audit, args, true).await,
        Commands::Collectk(args) => commands::collect::collect_kube(cli, &home, audit, args).await,
        Commands::Package { dir, output, cert } => {
            commands::package::package(cli.format, &home, dir, output.clone(), cert.clone()).await
        }
        Commands::Unpack {
            package,
            key,
            output,
        } => commands::package::unpack(cli.format, package, key.clone(), output.clone()).await,
        Commands::Upload {
            file,
            alias,
            issue,
            endpoint,
        } => {
            commands::upload::upload(
                cli,
                &home,
                file,
                alias.clone(),
                issue.clone(),
                endpoint.clone(),
            )
            .await
        }
        Commands::Download {
            url,
            uuid,
            alias,
            cluster_id,
            endpoint,
            output,
        } => {
            let target = commands::upload::DownloadTarget::from_args(
                url.as_deref(),
                uuid.as_deref(),
                alias.as_deref(),
                cluster_id.as_deref(),
            )?;
            commands::upload::download(cli.format, &home, target, endpoint.clone(), output).await
        }
        Commands::History => commands::upload::history(cli.format, &home),
        Commands::Config { key, value } => {
            commands::config::config(cli.format, &home, key.as_deref(), value.as_deref())
        }
    }
}
