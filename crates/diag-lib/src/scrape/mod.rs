//! File sampling performed on cluster hosts by the `scraper` helper
//!
//! Given glob patterns and a time window, a scrape reports every matching
//! file with its size. The collector uses the report both for the dry-run
//! size estimate and as the list of files to copy back.

mod insight;
mod logs;
mod tsdb;


pub use insight::{
    parse_chrony, parse_cpuinfo, parse_df, parse_meminfo, parse_ntpq, parse_os_release, CpuInfo,
    DiskInfo, InsightSnapshot, MemoryInfo, NetInfo, NtpInfo,
};
pub use logs::{classify_log, parse_head_time, LogClass, LogType, MAX_HEAD_LINE};
pub use tsdb::{select_blocks, BlockMeta, HEAD_RETENTION_HOURS};

use crate::error::{DiagError, Result};
use crate::models::CollectWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Files found by one scrape, as path -> size in bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub log_files: BTreeMap<String, u64>,
    #[serde(default)]
    pub config_files: BTreeMap<String, u64>,
    #[serde(default)]
    pub files: BTreeMap<String, u64>,
    #[serde(default)]
    pub prometheus_data: BTreeMap<String, u64>,
}

impl Sample {
    pub fn total_size(&self) -> u64 {
        [
            &self.log_files,
            &self.config_files,
            &self.files,
            &self.prometheus_data,
        ]
        .iter()
        .flat_map(|m| m.values())
        .sum()
    }

    /// Fold another sample into this one
    pub fn merge(&mut self, other: Sample) {
        self.log_files.extend(other.log_files);
        self.config_files.extend(other.config_files);
        self.files.extend(other.files);
        self.prometheus_data.extend(other.prometheus_data);
    }

    pub fn is_empty(&self) -> bool {
        self.log_files.is_empty()
            && self.config_files.is_empty()
            && self.files.is_empty()
            && self.prometheus_data.is_empty()
    }
}

/// What to look for
#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub log_globs: Vec<String>,
    pub config_globs: Vec<String>,
    pub file_globs: Vec<String>,
    pub window: CollectWindow,
    pub log_types: BTreeSet<LogType>,
    /// Prometheus data directory holding TSDB blocks
    pub prometheus_dir: Option<PathBuf>,
    pub now: DateTime<Utc>,
}

impl ScrapeOptions {
    pub fn new(window: CollectWindow) -> Self {
        Self {
            log_globs: Vec::new(),
            config_globs: Vec::new(),
            file_globs: Vec::new(),
            window,
            log_types: [LogType::Std].into_iter().collect(),
            prometheus_dir: None,
            now: Utc::now(),
        }
    }
}

/// Expand glob patterns into regular files, skipping bad patterns
fn expand(patterns: &[String]) -> Vec<PathBuf> {
    let mut out = BTreeSet::new();
    for pattern in patterns {
        match glob::glob(pattern) {
            Ok(paths) => {
                for path in paths.flatten() {
                    if path.is_file() {
                        out.insert(path);
                    }
                }
            }
            Err(e) => warn!(pattern = %pattern, error = %e, "Invalid glob pattern"),
        }
    }
    out.into_iter().collect()
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

fn mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Run a scrape on the local filesystem
pub fn scrape(opts: &ScrapeOptions) -> Result<Sample> {
    let mut sample = Sample::default();

    for path in expand(&opts.config_globs) {
        if let Some(size) = file_size(&path) {
            sample.config_files.insert(path.to_string_lossy().into_owned(), size);
        }
    }

    for path in expand(&opts.file_globs) {
        if let Some(size) = file_size(&path) {
            sample.files.insert(path.to_string_lossy().into_owned(), size);
        }
    }

    if opts.window.is_empty() {
        debug!("Empty window, no logs or TSDB blocks selected");
        return Ok(sample);
    }

    for path in expand(&opts.log_globs) {
        let class = match classify_log(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable log");
                continue;
            }
        };
        if !opts.log_types.contains(&class.log_type) {
            continue;
        }
        let Some(modified) = mtime(&path) else {
            continue;
        };
        if class.in_window(modified, &opts.window) {
            if let Some(size) = file_size(&path) {
                sample.log_files.insert(path.to_string_lossy().into_owned(), size);
            }
        }
    }

    if let Some(dir) = &opts.prometheus_dir {
        if !dir.is_dir() {
            return Err(DiagError::io_other(format!(
                "prometheus data dir {} does not exist",
                dir.display()
            )));
        }
        for block in select_blocks(dir, &opts.window, opts.now)? {
            let pattern = format!("{}/**/*", block.display());
            for path in expand(&[pattern]) {
                if let Some(size) = file_size(&path) {
                    sample
                        .prometheus_data
                        .insert(path.to_string_lossy().into_owned(), size);
                }
            }
        }
    }

    Ok(sample)
}
