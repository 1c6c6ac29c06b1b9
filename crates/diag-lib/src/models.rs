//! Data models for a collection run

use crate::error::{DiagError, Result};
use crate::topology::{Cluster, ComponentFilter};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Release string written into run metadata and upload headers
pub const DIAG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time interval bounding logs and metric slicing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CollectWindow {
    /// Build a window, rejecting `start > end`. Equal bounds form an empty window.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(DiagError::parse(format!(
                "start time {} is after end time {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse both bounds relative to `now`
    pub fn parse(from: &str, to: &str, now: DateTime<Utc>) -> Result<Self> {
        Self::new(parse_time(from, now)?, parse_time(to, now)?)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn seconds(&self) -> i64 {
        (self.end - self.start).num_seconds().max(0)
    }
}

/// Parse an instant given as RFC3339, `YYYY-MM-DD HH:MM:SS` (local time),
/// a relative offset such as `-2h` / `-30m`, or a bare integer of hours.
pub fn parse_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() || s == "now" {
        return Ok(now);
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Local
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| DiagError::parse(format!("ambiguous local time '{}'", s)));
        }
    }

    if let Ok(hours) = s.parse::<i64>() {
        return Ok(now + ChronoDuration::hours(hours));
    }

    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let offset = humantime::parse_duration(body)
        .map_err(|e| DiagError::parse(format!("invalid time '{}': {}", s, e)))?;
    let offset = ChronoDuration::from_std(offset)
        .map_err(|e| DiagError::parse(format!("time offset out of range '{}': {}", s, e)))?;

    Ok(if negative { now - offset } else { now + offset })
}

/// Evidence kinds a run can collect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectorKind {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "config")]
    Config,
    #[serde(rename = "config.realtime")]
    RealtimeConfig,
    #[serde(rename = "log.std")]
    LogStd,
    #[serde(rename = "log.slow")]
    LogSlow,
    #[serde(rename = "log.unknown")]
    LogUnknown,
    #[serde(rename = "perf")]
    Perf,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "monitor.metric")]
    MonitorMetric,
    #[serde(rename = "monitor.alert")]
    MonitorAlert,
    #[serde(rename = "monitor.raw")]
    MonitorRaw,
}

impl CollectorKind {
    pub const ALL: [CollectorKind; 11] = [
        Self::System,
        Self::Config,
        Self::RealtimeConfig,
        Self::LogStd,
        Self::LogSlow,
        Self::LogUnknown,
        Self::Perf,
        Self::Debug,
        Self::MonitorMetric,
        Self::MonitorAlert,
        Self::MonitorRaw,
    ];

    pub const DEFAULT: [CollectorKind; 6] = [
        Self::System,
        Self::Config,
        Self::RealtimeConfig,
        Self::LogStd,
        Self::MonitorMetric,
        Self::MonitorAlert,
    ];

    pub const EXTRA: [CollectorKind; 4] = [Self::LogSlow, Self::LogUnknown, Self::Perf, Self::Debug];

    pub fn name(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Config => "config",
            Self::RealtimeConfig => "config.realtime",
            Self::LogStd => "log.std",
            Self::LogSlow => "log.slow",
            Self::LogUnknown => "log.unknown",
            Self::Perf => "perf",
            Self::Debug => "debug",
            Self::MonitorMetric => "monitor.metric",
            Self::MonitorAlert => "monitor.alert",
            Self::MonitorRaw => "monitor.raw",
        }
    }

    /// Collectors that need SSH access to cluster hosts
    pub fn needs_ssh(&self) -> bool {
        matches!(
            self,
            Self::System
                | Self::Config
                | Self::LogStd
                | Self::LogSlow
                | Self::LogUnknown
                | Self::MonitorRaw
        )
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CollectorKind {
    type Err = DiagError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .iter()
            .find(|k| k.name() == s)
            .copied()
            .ok_or_else(|| DiagError::parse(format!("unknown collector '{}'", s)))
    }
}

/// Resolve the collector set from `--include`, `--exclude` and `--all`
pub fn resolve_collectors(
    include: &BTreeSet<CollectorKind>,
    exclude: &BTreeSet<CollectorKind>,
    include_all: bool,
    raw_monitor: bool,
) -> Result<Vec<CollectorKind>> {
    if let Some(both) = include.intersection(exclude).next() {
        return Err(DiagError::parse(format!(
            "collector '{}' is both included and excluded",
            both
        )));
    }

    let mut selected: BTreeSet<CollectorKind> = if include.is_empty() {
        CollectorKind::DEFAULT.into_iter().collect()
    } else {
        include.clone()
    };
    if include_all {
        selected.extend(CollectorKind::EXTRA);
    }
    if raw_monitor {
        selected.insert(CollectorKind::MonitorRaw);
    }
    for k in exclude {
        selected.remove(k);
    }

    Ok(CollectorKind::ALL
        .into_iter()
        .filter(|k| selected.contains(k))
        .collect())
}

/// Include and exclude prefixes applied to the metric catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl MetricFilter {
    /// Build from plain prefixes; a leading `-` marks an exclude prefix
    pub fn from_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for p in prefixes {
            let p = p.as_ref().trim();
            if p.is_empty() || p.starts_with('#') {
                continue;
            }
            match p.strip_prefix('-') {
                Some(ex) if !ex.is_empty() => filter.exclude.push(ex.to_string()),
                Some(_) => {}
                None => filter.include.push(p.to_string()),
            }
        }
        filter
    }

    pub fn merge(mut self, other: MetricFilter) -> Self {
        self.include.extend(other.include);
        self.exclude.extend(other.exclude);
        self
    }

    pub fn keeps(&self, metric: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|p| metric.starts_with(p.as_str())))
            && !self.exclude.iter().any(|e| metric.starts_with(e.as_str()))
    }

    pub fn apply(&self, metrics: &[String]) -> Vec<String> {
        metrics.iter().filter(|m| self.keeps(m)).cloned().collect()
    }
}

/// Everything a run was asked to do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectRequest {
    pub window: CollectWindow,
    pub collectors: Vec<CollectorKind>,
    #[serde(default)]
    pub filter: ComponentFilter,
    /// Per-transfer bandwidth limit in Kbit/s, 0 disables
    pub limit_kbps: u32,
    pub concurrency: usize,
    #[serde(default)]
    pub metric_filter: MetricFilter,
    /// Series·hours per metric query
    pub metric_limit: u64,
    /// CPU profile duration in seconds
    pub perf_duration: u64,
    pub exit_on_error: bool,
    pub compress_metrics: bool,
    pub compress_scp: bool,
    pub skip_confirm: bool,
    pub raw_monitor: bool,
}

impl CollectRequest {
    pub fn new(window: CollectWindow, collectors: Vec<CollectorKind>) -> Self {
        Self {
            window,
            collectors,
            filter: ComponentFilter::default(),
            limit_kbps: 0,
            concurrency: 5,
            metric_filter: MetricFilter::default(),
            metric_limit: 10_000,
            perf_duration: 30,
            exit_on_error: false,
            compress_metrics: true,
            compress_scp: true,
            skip_confirm: false,
            raw_monitor: false,
        }
    }

    pub fn wants(&self, kind: CollectorKind) -> bool {
        self.collectors.contains(&kind)
    }
}

/// Estimated size of one collection target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectStat {
    pub target: String,
    pub size: u64,
}

impl CollectStat {
    pub fn new(target: impl Into<String>, size: u64) -> Self {
        Self {
            target: target.into(),
            size,
        }
    }
}

/// Output of `prepare`, keyed by host
pub type PrepareStats = BTreeMap<String, Vec<CollectStat>>;

/// Contents of `cluster.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterJson {
    pub diag_version: String,
    pub cluster_name: String,
    pub cluster_id: String,
    pub cluster_type: String,
    pub deploy_type: String,
    pub session: String,
    pub begin_time: String,
    pub end_time: String,
    pub collectors: Vec<String>,
    pub raw_request: serde_json::Value,
    pub topology: Cluster,
}

/// Contents of `meta.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub diag_version: String,
    pub collector_host: String,
    pub session: String,
    pub request: CollectRequest,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-host error messages recorded by the runner
    #[serde(default)]
    pub errors: BTreeMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_parse_time_forms() {
        let n = now();
        assert_eq!(
            parse_time("2024-01-01T00:00:00Z", n).unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
        assert_eq!(parse_time("-2h", n).unwrap(), n - ChronoDuration::hours(2));
        assert_eq!(parse_time("-30m", n).unwrap(), n - ChronoDuration::minutes(30));
        assert_eq!(parse_time("-3", n).unwrap(), n - ChronoDuration::hours(3));
        assert_eq!(parse_time("", n).unwrap(), n);
        assert!(parse_time("yesterday-ish", n).is_err());
    }

    #[test]
    fn test_window_rejects_inverted_bounds() {
        let n = now();
        assert!(CollectWindow::parse("-1h", "-2h", n).is_err());

        let w = CollectWindow::parse("-2h", "-2h", n).unwrap();
        assert!(w.is_empty());
        assert_eq!(w.seconds(), 0);

        let w = CollectWindow::parse("2024-01-01T00:00:00Z", "2024-01-01T00:10:00Z", n).unwrap();
        assert_eq!(w.seconds(), 600);
    }

    #[test]
    fn test_resolve_collectors_defaults_and_all() {
        let none = BTreeSet::new();
        let defaults = resolve_collectors(&none, &none, false, false).unwrap();
        assert_eq!(defaults, CollectorKind::DEFAULT.to_vec());

        let all = resolve_collectors(&none, &none, true, false).unwrap();
        assert!(all.contains(&CollectorKind::Perf));
        assert!(all.contains(&CollectorKind::LogSlow));

        let exclude: BTreeSet<_> = [CollectorKind::MonitorMetric].into_iter().collect();
        let less = resolve_collectors(&none, &exclude, false, false).unwrap();
        assert!(!less.contains(&CollectorKind::MonitorMetric));

        let include: BTreeSet<_> = [CollectorKind::Perf].into_iter().collect();
        assert_eq!(
            resolve_collectors(&include, &none, false, false).unwrap(),
            vec![CollectorKind::Perf]
        );
        assert!(resolve_collectors(&include, &include, false, false).is_err());
    }

    #[test]
    fn test_metric_filter_prefixes() {
        let filter = MetricFilter::from_prefixes(["storage_", "sql_", "", "# comment"]);
        let catalog: Vec<String> = ["storage_x", "storage_y", "sql_a", "net_b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(filter.apply(&catalog), vec!["storage_x", "storage_y", "sql_a"]);

        let filter = MetricFilter::from_prefixes(["-storage_y"]);
        assert_eq!(filter.apply(&catalog), vec!["storage_x", "sql_a", "net_b"]);
    }

    #[test]
    fn test_collector_kind_names_round_trip() {
        for kind in CollectorKind::ALL {
            assert_eq!(kind.name().parse::<CollectorKind>().unwrap(), kind);
        }
        assert!("monitor".parse::<CollectorKind>().is_err());
    }
}
