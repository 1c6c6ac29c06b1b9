//! `collect`, `collectdm` and `collectk`

use crate::config::Config;
use crate::logging::AuditLog;
use crate::output::{self, print_info, print_success, print_warning, ConsoleProgress, OutputFormat};
use crate::Cli;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args};
use diag_lib::executor::{HelperCache, RemoteExecutor, SshBackend, SshOptions};
use diag_lib::http::{HttpFetcher, HttpOptions};
use diag_lib::task::{Progress, RunStatus};
use diag_lib::topology::{
    discover, Cluster, ComponentFilter, ComponentKind, Discovered, DiscoveryArgs, KubeTarget,
    ManualEndpoints, MetaStore, OrchestratedTarget,
};
use diag_lib::{
    new_session, resolve_collectors, CollectRequest, CollectWindow, CollectorKind, Manager,
    MetricFilter, SizeSummary,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Options shared by every collect flavor
#[derive(Args, Debug, Clone)]
pub struct CollectOpts {
    /// Start of the time window (RFC3339, "YYYY-MM-DD HH:MM:SS", or an offset such as -2h)
    #[arg(short = 'f', long = "from", default_value = "-2h", allow_hyphen_values = true)]
    pub from: String,

    /// End of the time window
    #[arg(short = 't', long = "to", default_value = "now", allow_hyphen_values = true)]
    pub to: String,

    /// Collectors to run instead of the default set
    #[arg(long, value_delimiter = ',')]
    pub include: Vec<CollectorKind>,

    /// Collectors to skip
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<CollectorKind>,

    /// Also collect slow and uncategorized logs, profiles and debug data
    #[arg(long)]
    pub all: bool,

    /// Only collect from components of these roles
    #[arg(short = 'R', long = "role", value_delimiter = ',')]
    pub roles: Vec<ComponentKind>,

    /// Only collect from these nodes (host:port)
    #[arg(short = 'N', long = "node", value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Bandwidth limit per file transfer in Kbit/s, negative picks the backend default
    #[arg(short = 'l', long, default_value_t = -1, allow_hyphen_values = true)]
    pub limit: i64,

    /// Metric name prefixes to collect, a leading '-' excludes
    #[arg(long = "metricsfilter", value_delimiter = ',', allow_hyphen_values = true)]
    pub metrics_filter: Vec<String>,

    /// File with one metric prefix per line
    #[arg(long = "metricsconfig")]
    pub metrics_config: Option<PathBuf>,

    /// Parent directory of the result directory
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Compress metric files
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub compress_metrics: bool,

    /// Compress file transfers
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub compress_scp: bool,

    /// Stop at the first failed task
    #[arg(long)]
    pub exit_on_error: bool,

    /// Duration of CPU profiles in seconds
    #[arg(long, default_value_t = 30)]
    pub perf_duration: u64,

    /// Also copy raw TSDB blocks from the monitor hosts
    #[arg(long)]
    pub raw_monitor: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CollectArgs {
    /// Cluster name
    pub cluster: String,

    #[command(flatten)]
    pub opts: CollectOpts,

    /// Coordinator endpoints; skips orchestrator metadata and collects over HTTP only
    #[arg(long = "pd", value_delimiter = ',')]
    pub pd: Vec<String>,

    /// Cluster id, for clusters given by endpoints
    #[arg(long)]
    pub cluster_id: Option<String>,

    /// SQL gateway endpoints (host:port[:status-port])
    #[arg(long = "sql-gateway", value_delimiter = ',')]
    pub sql_gateways: Vec<String>,

    /// Monitoring endpoints (host:port)
    #[arg(long = "monitor", value_delimiter = ',')]
    pub monitors: Vec<String>,

    /// SSH user, overrides the orchestrator metadata
    #[arg(long)]
    pub ssh_user: Option<String>,

    /// SSH private key
    #[arg(short = 'i', long)]
    pub identity_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct KubeArgs {
    /// Name of the cluster resource
    #[arg(long)]
    pub name: String,

    /// Namespace of the cluster resource
    #[arg(long)]
    pub namespace: Option<String>,

    #[command(flatten)]
    pub opts: CollectOpts,
}

/// Read one prefix per line; blank lines and `#` comments are skipped
fn load_metric_config(path: &Path) -> Result<MetricFilter> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metrics config {}", path.display()))?;
    Ok(MetricFilter::from_prefixes(content.lines()))
}

/// Turn the command line into a collection request
pub fn build_request(opts: &CollectOpts, cli_yes: bool, concurrency: usize, backend: SshBackend) -> Result<CollectRequest> {
    let window = CollectWindow::parse(&opts.from, &opts.to, Utc::now())?;

    let include: BTreeSet<CollectorKind> = opts.include.iter().copied().collect();
    let exclude: BTreeSet<CollectorKind> = opts.exclude.iter().copied().collect();
    let collectors = resolve_collectors(&include, &exclude, opts.all, opts.raw_monitor)?;

    let mut metric_filter = MetricFilter::from_prefixes(&opts.metrics_filter);
    if let Some(path) = &opts.metrics_config {
        metric_filter = metric_filter.merge(load_metric_config(path)?);
    }

    let mut request = CollectRequest::new(window, collectors);
    request.filter = ComponentFilter::new(opts.roles.iter().copied(), opts.nodes.iter().cloned());
    request.limit_kbps = if opts.limit < 0 {
        backend.default_limit_kbps()
    } else {
        u32::try_from(opts.limit).unwrap_or(u32::MAX)
    };
    request.concurrency = concurrency.max(1);
    request.metric_filter = metric_filter;
    request.perf_duration = opts.perf_duration;
    request.exit_on_error = opts.exit_on_error;
    request.compress_metrics = opts.compress_metrics;
    request.compress_scp = opts.compress_scp;
    request.skip_confirm = cli_yes;
    request.raw_monitor = opts.raw_monitor;
    Ok(request)
}

fn ssh_options(cli: &Cli, discovered: &Discovered, args: Option<&CollectArgs>, compress: bool) -> SshOptions {
    let mut opts = SshOptions {
        backend: cli.ssh.into(),
        connect_timeout: Duration::from_secs(cli.ssh_timeout),
        command_timeout: Duration::from_secs(cli.wait_timeout),
        compress,
        ..SshOptions::default()
    };
    if let Some(login) = &discovered.ssh {
        if !login.user.is_empty() {
            opts.user = login.user.clone();
        }
        opts.identity_file = login.identity_file.clone();
    }
    if let Some(args) = args {
        if let Some(user) = &args.ssh_user {
            opts.user = user.clone();
        }
        if let Some(identity) = &args.identity_file {
            opts.identity_file = Some(identity.clone());
        }
    }
    opts
}

fn build_executor(
    cluster: &Cluster,
    opts: SshOptions,
    home: &Path,
    config: &Config,
    fetcher: &HttpFetcher,
) -> Option<Arc<RemoteExecutor>> {
    if !cluster.mode.has_ssh() {
        info!(mode = cluster.mode.as_str(), "No SSH access in this deploy mode");
        return None;
    }
    let Some(factory) = RemoteExecutor::factory_for(opts.backend) else {
        warn!("SSH disabled, only HTTP collectors will run");
        return None;
    };
    let cache = HelperCache::new(
        home.join("components"),
        config.collect.mirror.clone(),
        fetcher.clone(),
    );
    Some(Arc::new(RemoteExecutor::new(cluster, opts, factory, cache)))
}

fn ask_confirmation() -> bool {
    print!("Do you want to continue? [y/N]: ");
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn start_audit(audit: &AuditLog, dir: &Path) {
    let opened = std::fs::create_dir_all(dir).and_then(|_| audit.open(dir));
    if let Err(e) = opened {
        warn!(dir = %dir.display(), error = %e, "Cannot write audit log");
    }
}

/// Confirm, collect and report on one discovered cluster
async fn run_collect(
    cli: &Cli,
    home: &Path,
    audit: &AuditLog,
    discovered: Discovered,
    opts: &CollectOpts,
    args: Option<&CollectArgs>,
) -> Result<()> {
    let config = Config::load(home)?;
    let backend: SshBackend = cli.ssh.into();
    let request = build_request(opts, cli.yes, cli.concurrency, backend)?;
    let fetcher = HttpFetcher::new(&HttpOptions::default())?;
    let ssh = ssh_options(cli, &discovered, args, request.compress_scp);
    let executor = build_executor(&discovered.cluster, ssh, home, &config, &fetcher);

    let session = new_session();
    let result_dir = opts
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!("diag-{}-{}", discovered.cluster.name, session));

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping collection");
            signal.cancel();
        }
    });

    let progress = match cli.format {
        OutputFormat::Default => Arc::new(Progress::with_sink(Arc::new(ConsoleProgress))),
        OutputFormat::Json => Arc::new(Progress::new()),
    };
    if cli.format == OutputFormat::Default {
        print_info(&format!(
            "Collecting {} from cluster {} between {} and {}",
            request
                .collectors
                .iter()
                .map(|k| k.name())
                .collect::<Vec<_>>()
                .join(", "),
            discovered.cluster.name,
            request.window.start.to_rfc3339(),
            request.window.end.to_rfc3339(),
        ));
    }

    if cli.yes {
        start_audit(audit, &result_dir);
    }
    let manager = Manager::new(discovered, request, fetcher, executor, session)
        .with_progress(progress)
        .with_cancel(&cancel);
    let format = cli.format;
    let confirm = |summary: &SizeSummary| {
        output::print_size_summary(summary, format);
        let accepted = ask_confirmation();
        if accepted {
            start_audit(audit, &result_dir);
        }
        accepted
    };
    let result = manager.run(&result_dir, confirm).await;
    audit.close();
    let outcome = result?;

    match cli.format {
        OutputFormat::Json => output::print_json(&json!({
            "result_dir": outcome.result_dir,
            "session": outcome.meta.session,
            "status": outcome.report.status(),
            "estimated_bytes": outcome.summary.total(),
            "errors": outcome.meta.errors,
        })),
        OutputFormat::Default => {
            if outcome.report.status() == RunStatus::Partial {
                for (host, errors) in &outcome.meta.errors {
                    for e in errors {
                        print_warning(&format!("{}: {}", host, e));
                    }
                }
                print_warning("Some data could not be collected, see meta.yaml for details");
            }
            print_success(&format!(
                "Collected data are stored in {}",
                outcome.result_dir.display()
            ));
            print_info(&format!(
                "Run `diag package {}` to package it for upload",
                outcome.result_dir.display()
            ));
        }
    }
    Ok(())
}

/// `collect` and `collectdm`
pub async fn collect(cli: &Cli, home: &Path, audit: &AuditLog, args: &CollectArgs, dm: bool) -> Result<()> {
    let discovery = if args.pd.is_empty() {
        let store = if dm { MetaStore::Dm } else { MetaStore::Cluster };
        DiscoveryArgs::Orchestrated(OrchestratedTarget::new(&args.cluster, store))
    } else {
        if dm {
            bail!("--pd is not supported for data-migration clusters");
        }
        DiscoveryArgs::Manual(ManualEndpoints {
            cluster_name: args.cluster.clone(),
            cluster_id: args.cluster_id.clone(),
            coordinators: args.pd.clone(),
            sql_gateways: args.sql_gateways.clone(),
            monitors: args.monitors.clone(),
        })
    };
    let discovered = discover(discovery)
        .await
        .with_context(|| format!("Failed to discover cluster {}", args.cluster))?;
    run_collect(cli, home, audit, discovered, &args.opts, Some(args)).await
}

/// `collectk`
pub async fn collect_kube(cli: &Cli, home: &Path, audit: &AuditLog, args: &KubeArgs) -> Result<()> {
    let target = KubeTarget {
        name: args.name.clone(),
        namespace: args.namespace.clone(),
    };
    let discovered = discover(DiscoveryArgs::Kubernetes(target))
        .await
        .with_context(|| format!("Failed to discover cluster {} on Kubernetes", args.name))?;
    run_collect(cli, home, audit, discovered, &args.opts, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        opts: CollectOpts,
    }

    fn opts(args: &[&str]) -> CollectOpts {
        let mut argv = vec!["collect"];
        argv.extend_from_slice(args);
        Wrapper::try_parse_from(argv).unwrap().opts
    }

    #[test]
    fn test_defaults() {
        let request = build_request(&opts(&[]), false, 5, SshBackend::Builtin).unwrap();
        assert_eq!(request.collectors, CollectorKind::DEFAULT.to_vec());
        assert_eq!(request.window.seconds(), 2 * 3600);
        assert_eq!(request.limit_kbps, 10_000);
        assert!(request.compress_metrics);
        assert!(request.compress_scp);
        assert_eq!(request.perf_duration, 30);

        let request = build_request(&opts(&[]), true, 5, SshBackend::System).unwrap();
        assert_eq!(request.limit_kbps, 100_000);
        assert!(request.skip_confirm);
    }

    #[test]
    fn test_collector_selection_and_filters() {
        let o = opts(&[
            "--include",
            "system,log.std,perf",
            "--exclude",
            "perf",
            "-R",
            "tikv,pd",
            "-N",
            "10.0.0.1:20160",
            "-l",
            "2000",
            "--compress-scp",
            "false",
        ]);
        let request = build_request(&o, false, 3, SshBackend::Builtin).unwrap();
        assert_eq!(request.collectors, vec![CollectorKind::System, CollectorKind::LogStd]);
        assert!(request.filter.roles.contains(&ComponentKind::KvStore));
        assert!(request.filter.roles.contains(&ComponentKind::Coordinator));
        assert!(request.filter.nodes.contains("10.0.0.1:20160"));
        assert_eq!(request.limit_kbps, 2000);
        assert!(!request.compress_scp);
        assert_eq!(request.concurrency, 3);
    }

    #[test]
    fn test_same_collector_included_and_excluded_is_rejected() {
        let o = opts(&["--include", "system", "--exclude", "system"]);
        assert!(build_request(&o, false, 5, SshBackend::Builtin).is_err());
    }

    #[test]
    fn test_unknown_collector_is_a_usage_error() {
        assert!(Wrapper::try_parse_from(["collect", "--include", "everything"]).is_err());
    }

    #[test]
    fn test_inverted_window_is_rejected() {
        let o = opts(&["-f", "2024-01-01T02:00:00Z", "-t", "2024-01-01T01:00:00Z"]);
        assert!(build_request(&o, false, 5, SshBackend::Builtin).is_err());
    }

    #[test]
    fn test_metric_prefixes_merge_flag_and_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("metrics.txt");
        std::fs::write(&file, "# storage metrics\ntikv_\n\n-tikv_raft\n").unwrap();

        let o = opts(&[
            "--metricsfilter",
            "pd_",
            "--metricsconfig",
            file.to_str().unwrap(),
        ]);
        let request = build_request(&o, false, 5, SshBackend::Builtin).unwrap();
        let filter = &request.metric_filter;
        assert_eq!(filter.include, vec!["pd_", "tikv_"]);
        assert_eq!(filter.exclude, vec!["tikv_raft"]);
        assert!(filter.keeps("tikv_engine_size"));
        assert!(!filter.keeps("tikv_raft_log"));
    }
}
