//! Log and static config files, sampled by the on-host scraper

use super::remote::{fetch_files, glob_args, run_scrapes, sample_stats, ScrapeTarget};
use super::{async_trait, CollectContext, Collector};
use crate::error::Result;
use crate::models::{CollectorKind, PrepareStats};
use crate::scrape::{LogType, Sample};
use crate::task::RunReport;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Group patterns per host, one scraper call per host
fn targets_by_host<F>(ctx: &CollectContext, flag: &str, extra: &str, patterns: F) -> Vec<ScrapeTarget>
where
    F: Fn(&crate::topology::Component) -> Option<String>,
{
    let mut by_host: BTreeMap<String, (ScrapeTarget, Vec<String>)> = BTreeMap::new();
    for c in ctx.components() {
        let Some(pattern) = patterns(c) else {
            continue;
        };
        let entry = by_host
            .entry(c.host.clone())
            .or_insert_with(|| (ScrapeTarget::new(&c.host, ctx.helper_for(c)), Vec::new()));
        if !entry.1.contains(&pattern) {
            entry.1.push(pattern);
        }
    }
    by_host
        .into_values()
        .map(|(mut target, patterns)| {
            let mut args = glob_args(flag, &patterns);
            if !extra.is_empty() {
                args.push(' ');
                args.push_str(extra);
            }
            target.invocations.push(args);
            target
        })
        .collect()
}

fn log_files(sample: &Sample) -> &BTreeMap<String, u64> {
    &sample.log_files
}

fn config_files(sample: &Sample) -> &BTreeMap<String, u64> {
    &sample.config_files
}

/// Logs of one type under each component's log dir
pub struct LogCollector {
    kind: CollectorKind,
    log_type: LogType,
}

impl LogCollector {
    /// `kind` must be one of the `log.*` kinds; anything else collects standard logs
    pub fn new(kind: CollectorKind) -> Self {
        let log_type = match kind {
            CollectorKind::LogSlow => LogType::Slow,
            CollectorKind::LogUnknown => LogType::Unknown,
            _ => LogType::Std,
        };
        Self { kind, log_type }
    }

    fn targets(&self, ctx: &CollectContext) -> Vec<ScrapeTarget> {
        let extra = format!("--logtype {}", self.log_type);
        targets_by_host(ctx, "log", &extra, |c| {
            c.log_dir().map(|dir| format!("{}/*", dir.trim_end_matches('/')))
        })
    }
}

#[async_trait]
impl Collector for LogCollector {
    fn kind(&self) -> CollectorKind {
        self.kind
    }

    fn describe(&self) -> &'static str {
        match self.log_type {
            LogType::Std => "log files of components",
            LogType::Slow => "slow query logs of components",
            LogType::Unknown => "uncategorized files in log directories",
        }
    }

    async fn prepare(&self, ctx: &CollectContext) -> Result<PrepareStats> {
        let (samples, _) = run_scrapes(ctx, self.kind.name(), self.targets(ctx)).await?;
        Ok(sample_stats(&samples, log_files))
    }

    async fn collect(&self, ctx: &CollectContext, result_dir: &Path) -> Result<RunReport> {
        let (samples, mut report) = run_scrapes(ctx, self.kind.name(), self.targets(ctx)).await?;
        let files: usize = samples.values().map(|s| s.log_files.len()).sum();
        info!(collector = %self.kind, hosts = samples.len(), files, "Downloading log files");
        report.merge(fetch_files(ctx, "log files", result_dir, &samples, log_files).await?);
        Ok(report)
    }
}

/// Files under each component's `conf/` directory
pub struct ConfigCollector;

impl ConfigCollector {
    fn targets(&self, ctx: &CollectContext) -> Vec<ScrapeTarget> {
        targets_by_host(ctx, "config", "", |c| {
            if c.kind.is_monitor_adjacent() {
                return None;
            }
            c.deploy_dir()
                .map(|dir| format!("{}/conf/*", dir.trim_end_matches('/')))
        })
    }
}

#[async_trait]
impl Collector for ConfigCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Config
    }

    fn describe(&self) -> &'static str {
        "config files of components"
    }

    async fn prepare(&self, ctx: &CollectContext) -> Result<PrepareStats> {
        let (samples, _) = run_scrapes(ctx, "config files", self.targets(ctx)).await?;
        Ok(sample_stats(&samples, config_files))
    }

    async fn collect(&self, ctx: &CollectContext, result_dir: &Path) -> Result<RunReport> {
        let (samples, mut report) = run_scrapes(ctx, "config files", self.targets(ctx)).await?;
        report.merge(fetch_files(ctx, "config files", result_dir, &samples, config_files).await?);
        Ok(report)
    }
}
