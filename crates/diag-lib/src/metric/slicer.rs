//! HTTP side of the metric dump

use super::{block_seconds, endpoint_dir, metric_file_name, query_with_labels, sub_windows};
use crate::error::{DiagError, Result};
use crate::http::HttpFetcher;
use crate::models::{CollectWindow, MetricFilter};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_micros(300);

pub(crate) const METRICS_SUBDIR: &str = "monitor/metrics";
pub(crate) const ALERTS_SUBDIR: &str = "monitor/alerts";

/// Knobs of a metric dump
#[derive(Debug, Clone)]
pub struct SliceOptions {
    pub window: CollectWindow,
    pub filter: MetricFilter,
    /// Series·hours per query
    pub limit: u64,
    pub concurrency: usize,
    pub compress: bool,
    /// Label matchers added to every query
    pub labels: BTreeMap<String, String>,
    pub catalog_timeout: Duration,
    pub query_timeout: Duration,
    /// Upper bound on all attempts of one query
    pub retry_deadline: Duration,
}

impl SliceOptions {
    pub fn new(window: CollectWindow) -> Self {
        Self {
            window,
            filter: MetricFilter::default(),
            limit: super::DEFAULT_SERIES_LIMIT,
            concurrency: 5,
            compress: true,
            labels: BTreeMap::new(),
            catalog_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(60),
            retry_deadline: Duration::from_secs(120),
        }
    }
}

/// What a dump produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SliceReport {
    pub files: usize,
    pub bytes: u64,
    pub failed_queries: usize,
    /// Metrics without active series
    pub idle_metrics: usize,
}

impl SliceReport {
    fn merge(&mut self, other: SliceReport) {
        self.files += other.files;
        self.bytes += other.bytes;
        self.failed_queries += other.failed_queries;
        self.idle_metrics += other.idle_metrics;
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    status: String,
    data: T,
}

/// Dumps metrics and alerts from one or more monitoring endpoints
pub struct MetricSlicer {
    fetcher: HttpFetcher,
    endpoints: Vec<String>,
    opts: SliceOptions,
}

impl MetricSlicer {
    pub fn new(fetcher: HttpFetcher, endpoints: Vec<String>, opts: SliceOptions) -> Self {
        Self {
            fetcher,
            endpoints,
            opts,
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn workers(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.opts.concurrency.min(cpus).max(1)
    }

    async fn fetch_catalog(&self, endpoint: &str) -> Result<Vec<String>> {
        let url = self.fetcher.url(endpoint, "/api/v1/label/__name__/values");
        let body = self.fetcher.get(&url, self.opts.catalog_timeout).await?;
        let parsed: ApiResponse<Vec<String>> = serde_json::from_slice(&body)?;
        if !parsed.status.is_empty() && parsed.status != "success" {
            return Err(DiagError::parse(format!(
                "metric catalog from {} has status {}",
                endpoint, parsed.status
            )));
        }
        Ok(parsed.data)
    }

    /// Filtered metric catalog from the first endpoint that answers
    pub async fn catalog(&self) -> Result<(String, Vec<String>)> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            match self.fetch_catalog(endpoint).await {
                Ok(all) => {
                    let kept = self.opts.filter.apply(&all);
                    info!(
                        endpoint = %endpoint,
                        total = all.len(),
                        kept = kept.len(),
                        "Fetched metric catalog"
                    );
                    return Ok((endpoint.clone(), kept));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Metric catalog unavailable");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            DiagError::TopologyNotFound("no monitoring endpoint in topology".to_string())
        }))
    }

    /// Number of active series of a metric
    pub async fn series_count(&self, endpoint: &str, metric: &str) -> Result<u64> {
        let base = self.fetcher.url(endpoint, "/api/v1/series");
        let url = url::Url::parse_with_params(
            &base,
            &[("match[]", query_with_labels(metric, &self.opts.labels))],
        )
        .map_err(|e| DiagError::parse(format!("bad series url {}: {}", base, e)))?;
        let body = self.fetcher.get(url.as_str(), self.opts.catalog_timeout).await?;
        let parsed: ApiResponse<Vec<serde_json::Value>> = serde_json::from_slice(&body)?;
        Ok(parsed.data.len() as u64)
    }

    async fn query_once(&self, endpoint: &str, query: &str, at: DateTime<Utc>) -> Result<Vec<u8>> {
        let url = self.fetcher.url(endpoint, "/api/v1/query");
        let form = [
            ("query", query.to_string()),
            ("time", at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];
        self.fetcher
            .post_form(&url, &form, self.opts.query_timeout)
            .await
    }

    async fn query_with_retry(&self, endpoint: &str, query: &str, at: DateTime<Utc>) -> Result<Vec<u8>> {
        let attempts = async {
            let mut delay = RETRY_DELAY;
            let mut last_err = None;
            for attempt in 1..=RETRY_ATTEMPTS {
                match self.query_once(endpoint, query, at).await {
                    Ok(body) => return Ok(body),
                    Err(e) => {
                        debug!(endpoint = %endpoint, query = %query, attempt, error = %e, "Query failed, retrying");
                        last_err = Some(e);
                        if attempt < RETRY_ATTEMPTS {
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| DiagError::Bug("query retried zero times".to_string())))
        };
        tokio::time::timeout(self.opts.retry_deadline, attempts)
            .await
            .map_err(|_| DiagError::Timeout(format!("query {} on {}", query, endpoint)))?
    }

    async fn write_body(&self, path: &Path, body: Vec<u8>) -> Result<u64> {
        let data = if self.opts.compress {
            tokio::task::spawn_blocking(move || zstd::encode_all(&body[..], 0)).await??
        } else {
            body
        };
        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn dump_metric(
        &self,
        endpoint: &str,
        metric: &str,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SliceReport> {
        let mut report = SliceReport::default();
        let series = match self.series_count(endpoint, metric).await {
            Ok(s) => s,
            Err(e) => {
                error!(endpoint = %endpoint, metric = %metric, error = %e, "Failed to count series");
                report.failed_queries += 1;
                return Ok(report);
            }
        };
        let Some(block) = block_seconds(series, self.opts.limit) else {
            debug!(metric = %metric, "Metric has no series, skipping");
            report.idle_metrics += 1;
            return Ok(report);
        };

        let selector = query_with_labels(metric, &self.opts.labels);
        for (q_start, q_end) in sub_windows(&self.opts.window, block) {
            if cancel.is_cancelled() {
                return Err(DiagError::Cancelled);
            }
            let secs = (q_end - q_start).num_seconds();
            let query = format!("{}[{}s]", selector, secs);
            match self.query_with_retry(endpoint, &query, q_end).await {
                Ok(body) => {
                    let name = metric_file_name(metric, q_start, q_end, self.opts.compress);
                    report.bytes += self.write_body(&dir.join(&name), body).await?;
                    report.files += 1;
                }
                Err(e) => {
                    error!(
                        endpoint = %endpoint,
                        metric = %metric,
                        from = %q_start.to_rfc3339(),
                        to = %q_end.to_rfc3339(),
                        error = %e,
                        "Dropping sub-window after retries"
                    );
                    report.failed_queries += 1;
                }
            }
        }
        Ok(report)
    }

    async fn dump_endpoint(
        &self,
        endpoint: &str,
        metrics: &[String],
        result_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SliceReport> {
        let dir = result_dir.join(METRICS_SUBDIR).join(endpoint_dir(endpoint));
        tokio::fs::create_dir_all(&dir).await?;

        let dumps: Vec<_> = metrics
            .iter()
            .map(|m| self.dump_metric(endpoint, m, &dir, cancel))
            .collect();
        let results: Vec<Result<SliceReport>> = stream::iter(dumps)
            .buffer_unordered(self.workers())
            .collect()
            .await;

        let mut report = SliceReport::default();
        for r in results {
            report.merge(r?);
        }
        info!(
            endpoint = %endpoint,
            files = report.files,
            bytes = report.bytes,
            failed = report.failed_queries,
            "Metric dump finished"
        );
        Ok(report)
    }

    /// Dump `metrics` from every endpoint into `<result_dir>/monitor/metrics/<host-port>/`
    pub async fn slice(
        &self,
        metrics: &[String],
        result_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SliceReport> {
        let dumps: Vec<_> = self
            .endpoints
            .iter()
            .map(|e| self.dump_endpoint(e, metrics, result_dir, cancel))
            .collect();
        let per_endpoint = futures::future::join_all(dumps).await;

        let mut report = SliceReport::default();
        for r in per_endpoint {
            report.merge(r?);
        }
        Ok(report)
    }

    /// Save the `ALERTS` series of every endpoint; fails only if none answered
    pub async fn alerts(&self, result_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        let mut last_err = None;
        for endpoint in &self.endpoints {
            let dir = result_dir.join(ALERTS_SUBDIR).join(endpoint_dir(endpoint));
            let url = self.fetcher.url(endpoint, "/api/v1/query");
            let form = [("query", "ALERTS".to_string())];
            match self
                .fetcher
                .post_form(&url, &form, self.opts.catalog_timeout)
                .await
            {
                Ok(body) => {
                    tokio::fs::create_dir_all(&dir).await?;
                    let name = if self.opts.compress {
                        "alerts.json.zst"
                    } else {
                        "alerts.json"
                    };
                    let path = dir.join(name);
                    self.write_body(&path, body).await?;
                    written.push(path);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Failed to query alerts");
                    last_err = Some(e);
                }
            }
        }
        match (written.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            _ => Ok(written),
        }
    }
}
