//! Time-sliced export of a Prometheus store
//!
//! Every metric of the (filtered) catalog is dumped as a series of range
//! vector queries. The sub-window length adapts to the metric's series count
//! so that each query stays under `limit` series·hours.

mod slicer;

#[cfg(test)]
mod tests;

pub use slicer::{MetricSlicer, SliceOptions, SliceReport};

use crate::models::CollectWindow;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::collections::BTreeMap;

/// Shortest sub-window in seconds
pub const MIN_BLOCK_SECS: i64 = 5 * 60;
/// Longest sub-window in seconds
pub const MAX_BLOCK_SECS: i64 = 120 * 60;
/// Series·hours per query when the user gives no limit
pub const DEFAULT_SERIES_LIMIT: u64 = 10_000;

/// Sub-window length for a metric with `series` active series, `None` for idle metrics
pub fn block_seconds(series: u64, limit: u64) -> Option<i64> {
    if series == 0 {
        return None;
    }
    let limit = if limit == 0 { DEFAULT_SERIES_LIMIT } else { limit };
    let raw = (3600u128 * limit as u128 / series as u128).min(i64::MAX as u128) as i64;
    Some(raw.clamp(MIN_BLOCK_SECS, MAX_BLOCK_SECS))
}

/// Split a window into `[q_start, q_end]` pieces walking backward from the end.
/// The earliest piece is cut short at the window start.
pub fn sub_windows(window: &CollectWindow, block_secs: i64) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut out = Vec::new();
    if block_secs <= 0 {
        return out;
    }
    let step = Duration::seconds(block_secs);
    let mut q_end = window.end;
    while q_end > window.start {
        let q_start = (q_end - step).max(window.start);
        out.push((q_start, q_end));
        q_end = q_end - step;
    }
    out
}

/// Metric selector with optional label matchers, e.g. `up{job="tidb"}`
pub fn query_with_labels(metric: &str, labels: &BTreeMap<String, String>) -> String {
    if labels.is_empty() {
        return metric.to_string();
    }
    let matchers: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{}{{{}}}", metric, matchers.join(","))
}

/// File name of one dumped sub-window; sorts by time within a metric
pub fn metric_file_name(metric: &str, q_start: DateTime<Utc>, q_end: DateTime<Utc>, compress: bool) -> String {
    format!(
        "{}_{}_{}.json{}",
        metric,
        q_start.to_rfc3339_opts(SecondsFormat::Secs, true),
        q_end.to_rfc3339_opts(SecondsFormat::Secs, true),
        if compress { ".zst" } else { "" }
    )
}

/// Directory name for a monitoring endpoint, `host-port`
pub fn endpoint_dir(endpoint: &str) -> String {
    endpoint
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .replace(':', "-")
}

/// Dry-run size of a metric dump; roughly 2.5% of the raw sample volume
pub fn estimate_size(metrics: usize, instances: usize, window_secs: i64) -> u64 {
    let raw = 11u128 * metrics as u128 * instances as u128 * window_secs.max(0) as u128;
    (raw as f64 * 0.025) as u64
}
