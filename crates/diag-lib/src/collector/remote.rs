//! Scraper-driven collection shared by the file-based collectors

use super::CollectContext;
use crate::error::{DiagError, Result};
use crate::executor::{shell_quote, HelperSpec};
use crate::models::{CollectStat, PrepareStats};
use crate::scrape::Sample;
use crate::task::{parallel, Node, RunReport, TaskBuilder};
use chrono::SecondsFormat;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Scraper invocations to run on one host
#[derive(Debug, Clone)]
pub(crate) struct ScrapeTarget {
    pub host: String,
    pub helper: HelperSpec,
    /// Arguments of each `scraper scrape` call, already shell quoted
    pub invocations: Vec<String>,
}

impl ScrapeTarget {
    pub fn new(host: &str, helper: HelperSpec) -> Self {
        Self {
            host: host.to_string(),
            helper,
            invocations: Vec::new(),
        }
    }
}

/// `--<flag> '<glob>'` for every pattern
pub(crate) fn glob_args(flag: &str, patterns: &[String]) -> String {
    patterns
        .iter()
        .map(|p| format!("--{} {}", flag, shell_quote(p)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn scrape_command(ctx: &CollectContext, args: &str) -> String {
    let window = &ctx.request.window;
    format!(
        "{} scrape {} -f {} -t {}",
        ctx.helper_path(),
        args,
        shell_quote(&window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
        shell_quote(&window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
    )
}

/// Ship the helper, run the scrapes and remove the helper again.
/// Returns the merged sample of every host that answered.
pub(crate) async fn run_scrapes(
    ctx: &CollectContext,
    what: &str,
    targets: Vec<ScrapeTarget>,
) -> Result<(BTreeMap<String, Sample>, RunReport)> {
    if targets.is_empty() {
        return Ok((BTreeMap::new(), RunReport::default()));
    }

    let helpers: BTreeSet<(String, String)> = targets
        .iter()
        .map(|t| (t.helper.os.clone(), t.helper.arch.clone()))
        .collect();
    let downloads: Vec<Node> = helpers
        .into_iter()
        .filter_map(|(os, arch)| {
            let helper = targets
                .iter()
                .find(|t| t.helper.os == os && t.helper.arch == arch)?
                .helper
                .clone();
            Some(
                TaskBuilder::new()
                    .download(helper)
                    .build_node(format!("Downloading scraper for {}/{}", os, arch)),
            )
        })
        .collect();

    let samples: Arc<DashMap<String, Sample>> = Arc::new(DashMap::new());
    let mut scrapes = Vec::new();
    for target in targets {
        let commands: Vec<String> = target
            .invocations
            .iter()
            .map(|args| scrape_command(ctx, args))
            .collect();
        let sink = samples.clone();
        let host = target.host.clone();
        let node = TaskBuilder::new()
            .mkdir(&target.host, ctx.helper_dir())
            .copy_component(&target.host, target.helper, ctx.helper_dir())
            .func(&target.host, "scrape", move |step| {
                let commands = commands.clone();
                let sink = sink.clone();
                let host = host.clone();
                async move {
                    let executor = step.executor()?.clone();
                    let mut merged = Sample::default();
                    for cmd in &commands {
                        let out = executor.shell_checked(&host, cmd, false).await?;
                        let sample: Sample = serde_json::from_slice(&out.stdout).map_err(|e| {
                            DiagError::parse(format!("scraper output from {}: {}", host, e))
                        })?;
                        merged.merge(sample);
                    }
                    debug!(host = %host, bytes = merged.total_size(), "Scrape finished");
                    sink.insert(host, merged);
                    Ok(())
                }
                .boxed()
            })
            .cleanup_rmdir(&target.host, ctx.temp_dir())
            .build_node(format!("Scraping {} on {}", what, target.host));
        scrapes.push(node);
    }

    let report = ctx
        .runner
        .run(vec![
            parallel("Download necessary tools", downloads),
            parallel(format!("Scrape {}", what), scrapes),
        ])
        .await?;
    for (host, errors) in report.errors_by_host() {
        warn!(host = %host, errors = ?errors, "Scrape incomplete");
    }

    let samples = Arc::try_unwrap(samples)
        .map(|m| m.into_iter().collect())
        .unwrap_or_else(|shared| {
            shared
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect()
        });
    Ok((samples, report))
}

/// Per-file stats of the selected part of each sample
pub(crate) fn sample_stats(
    samples: &BTreeMap<String, Sample>,
    select: fn(&Sample) -> &BTreeMap<String, u64>,
) -> PrepareStats {
    samples
        .iter()
        .map(|(host, sample)| {
            let stats = select(sample)
                .iter()
                .map(|(path, size)| CollectStat::new(path.clone(), *size))
                .collect();
            (host.clone(), stats)
        })
        .collect()
}

/// Local path a remote file is copied to: `<result>/<host>/<remote path>`
pub(crate) fn local_copy_path(result_dir: &Path, host: &str, remote: &str) -> PathBuf {
    let mut path = result_dir.join(host);
    for part in remote.split('/').filter(|p| !p.is_empty() && *p != "..") {
        path.push(part);
    }
    path
}

/// Copy the selected files of every sample back to the local result dir
pub(crate) async fn fetch_files(
    ctx: &CollectContext,
    what: &str,
    result_dir: &Path,
    samples: &BTreeMap<String, Sample>,
    select: fn(&Sample) -> &BTreeMap<String, u64>,
) -> Result<RunReport> {
    let request = &ctx.request;
    let mut nodes = Vec::new();
    for (host, sample) in samples {
        let files = select(sample);
        if files.is_empty() {
            continue;
        }
        let mut builder = TaskBuilder::new();
        for remote in files.keys() {
            let local = local_copy_path(result_dir, host, remote);
            builder = builder.copy_from(
                host,
                remote.as_str(),
                local.to_string_lossy(),
                request.limit_kbps,
                request.compress_scp,
            );
        }
        nodes.push(builder.build_node(format!("Downloading {} from {}", what, host)));
    }
    if nodes.is_empty() {
        return Ok(RunReport::default());
    }
    ctx.runner
        .run(vec![parallel(format!("Download {}", what), nodes)])
        .await
}
