//! Monitoring data: metric slices, alerts and raw TSDB blocks
//!
//! Monitor collectors work on every monitoring endpoint of the topology and
//! ignore the role and node filters.

use super::remote::{fetch_files, run_scrapes, sample_stats, ScrapeTarget};
use super::{async_trait, CollectContext, Collector};
use crate::error::Result;
use crate::executor::shell_quote;
use crate::metric::{estimate_size, MetricSlicer, SliceOptions};
use crate::models::{CollectStat, CollectorKind, PrepareStats};
use crate::scrape::Sample;
use crate::task::{RunReport, TaskOutcome};
use crate::topology::{attr, ComponentKind};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

fn slicer(ctx: &CollectContext) -> MetricSlicer {
    let request = &ctx.request;
    let mut opts = SliceOptions::new(request.window);
    opts.filter = request.metric_filter.clone();
    opts.limit = request.metric_limit;
    opts.concurrency = request.concurrency;
    opts.compress = request.compress_metrics;
    MetricSlicer::new(ctx.fetcher.clone(), ctx.cluster.monitors(), opts)
}

/// Record a step that ran outside the task runner
fn outcome(ctx: &CollectContext, label: &str, host: Option<String>, result: Result<()>) -> Result<RunReport> {
    let error = match result {
        Ok(()) => None,
        Err(e) if ctx.request.exit_on_error => return Err(e),
        Err(e) => Some(e.to_string()),
    };
    Ok(RunReport {
        outcomes: vec![TaskOutcome {
            label: label.to_string(),
            host,
            error,
        }],
    })
}

/// Time-sliced dump of every metric
pub struct MetricCollector;

#[async_trait]
impl Collector for MetricCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::MonitorMetric
    }

    fn describe(&self) -> &'static str {
        "metrics from monitoring system"
    }

    async fn prepare(&self, ctx: &CollectContext) -> Result<PrepareStats> {
        let mut stats = PrepareStats::new();
        if ctx.cluster.monitors().is_empty() {
            return Ok(stats);
        }
        match slicer(ctx).catalog().await {
            Ok((endpoint, metrics)) => {
                let size = estimate_size(
                    metrics.len(),
                    ctx.cluster.components.len(),
                    ctx.request.window.seconds(),
                );
                stats.insert(
                    endpoint,
                    vec![CollectStat::new(format!("{} metrics, compressed", metrics.len()), size)],
                );
            }
            Err(e) => warn!(error = %e, "Cannot estimate metric volume"),
        }
        Ok(stats)
    }

    async fn collect(&self, ctx: &CollectContext, result_dir: &Path) -> Result<RunReport> {
        let monitors = ctx.cluster.monitors();
        if monitors.is_empty() {
            info!("No monitoring endpoint in topology, skipping metrics");
            return Ok(RunReport::default());
        }
        let slicer = slicer(ctx);
        let cancel = ctx.runner.cancel_token();
        let result = async {
            let (endpoint, metrics) = slicer.catalog().await?;
            info!(endpoint = %endpoint, metrics = metrics.len(), "Dumping metrics");
            slicer.slice(&metrics, result_dir, &cancel).await.map(|_| ())
        }
        .await;
        outcome(ctx, "Dump metrics", monitors.first().cloned(), result)
    }
}

/// Currently firing alerts
pub struct AlertCollector;

#[async_trait]
impl Collector for AlertCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::MonitorAlert
    }

    fn describe(&self) -> &'static str {
        "alert lists from monitoring system"
    }

    async fn prepare(&self, _ctx: &CollectContext) -> Result<PrepareStats> {
        Ok(PrepareStats::new())
    }

    async fn collect(&self, ctx: &CollectContext, result_dir: &Path) -> Result<RunReport> {
        let monitors = ctx.cluster.monitors();
        if monitors.is_empty() {
            return Ok(RunReport::default());
        }
        let result = slicer(ctx).alerts(result_dir).await.map(|_| ());
        outcome(ctx, "Query alerts", monitors.first().cloned(), result)
    }
}

fn prometheus_data(sample: &Sample) -> &BTreeMap<String, u64> {
    &sample.prometheus_data
}

/// TSDB blocks copied from the monitor hosts
pub struct RawMonitorCollector;

impl RawMonitorCollector {
    fn targets(&self, ctx: &CollectContext) -> Vec<ScrapeTarget> {
        let mut by_host: BTreeMap<String, ScrapeTarget> = BTreeMap::new();
        for c in ctx.cluster.of_kind(ComponentKind::Monitor) {
            let data_dir = match (c.attr(attr::DATA_DIR), c.deploy_dir()) {
                (Some(dir), _) if !dir.is_empty() => dir.to_string(),
                (_, Some(deploy)) => format!("{}/data", deploy.trim_end_matches('/')),
                _ => {
                    warn!(node = %c.id(), "Monitor has no data dir, skipping raw data");
                    continue;
                }
            };
            by_host
                .entry(c.host.clone())
                .or_insert_with(|| ScrapeTarget::new(&c.host, ctx.helper_for(c)))
                .invocations
                .push(format!("--prometheus {}", shell_quote(&data_dir)));
        }
        by_host.into_values().collect()
    }
}

#[async_trait]
impl Collector for RawMonitorCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::MonitorRaw
    }

    fn describe(&self) -> &'static str {
        "raw data of the monitoring system"
    }

    async fn prepare(&self, ctx: &CollectContext) -> Result<PrepareStats> {
        let (samples, _) = run_scrapes(ctx, "monitor data", self.targets(ctx)).await?;
        Ok(sample_stats(&samples, prometheus_data))
    }

    async fn collect(&self, ctx: &CollectContext, result_dir: &Path) -> Result<RunReport> {
        let (samples, mut report) = run_scrapes(ctx, "monitor data", self.targets(ctx)).await?;
        report.merge(fetch_files(ctx, "monitor data", result_dir, &samples, prometheus_data).await?);
        Ok(report)
    }
}
