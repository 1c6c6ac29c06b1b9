//! Dry-run size summary

use crate::models::{CollectStat, PrepareStats};
use serde::Serialize;
use std::collections::BTreeMap;

/// Estimated bytes per host across all collectors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SizeSummary {
    pub hosts: BTreeMap<String, HostSize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostSize {
    pub files: usize,
    pub bytes: u64,
}

impl SizeSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the stats of one collector
    pub fn add(&mut self, stats: &PrepareStats) {
        for (host, items) in stats {
            let entry = self.hosts.entry(host.clone()).or_default();
            entry.files += items.len();
            entry.bytes += items.iter().map(|s: &CollectStat| s.size).sum::<u64>();
        }
    }

    pub fn total(&self) -> u64 {
        self.hosts.values().map(|h| h.bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Append every stat of `from` into `into`
pub fn merge_stats(into: &mut PrepareStats, from: PrepareStats) {
    for (host, stats) in from {
        into.entry(host).or_default().extend(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(entries: &[(&str, &str, u64)]) -> PrepareStats {
        let mut out = PrepareStats::new();
        for (host, target, size) in entries {
            out.entry(host.to_string())
                .or_default()
                .push(CollectStat::new(*target, *size));
        }
        out
    }

    #[test]
    fn test_summary_sums_per_host_and_total() {
        let mut summary = SizeSummary::new();
        summary.add(&stats(&[("10.0.0.1", "/a.log", 100), ("10.0.0.1", "/b.log", 50)]));
        summary.add(&stats(&[("10.0.0.1", "/conf/pd.toml", 10), ("10.0.0.9:9090", "12 metrics, compressed", 1000)]));

        assert_eq!(summary.hosts["10.0.0.1"], HostSize { files: 3, bytes: 160 });
        assert_eq!(summary.hosts["10.0.0.9:9090"].bytes, 1000);
        assert_eq!(summary.total(), 1160);
    }

    #[test]
    fn test_empty_stats_give_empty_summary() {
        let mut summary = SizeSummary::new();
        summary.add(&PrepareStats::new());
        assert!(summary.is_empty());
        assert_eq!(summary.total(), 0);
    }

    #[test]
    fn test_merge_stats_appends() {
        let mut all = stats(&[("h", "/x", 1)]);
        merge_stats(&mut all, stats(&[("h", "/y", 2), ("g", "/z", 3)]));
        assert_eq!(all["h"].len(), 2);
        assert_eq!(all["g"][0].size, 3);
    }
}
