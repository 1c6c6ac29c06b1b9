//! Selection of Prometheus TSDB blocks overlapping a window

use crate::error::Result;
use crate::models::CollectWindow;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Hours of samples assumed to still live in the in-memory head
pub const HEAD_RETENTION_HOURS: i64 = 3;

const HEAD_DIR: &str = "chunks_head";

/// Time range of a persisted block, in milliseconds
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub min_time: i64,
    pub max_time: i64,
}

impl BlockMeta {
    pub fn overlaps(&self, window: &CollectWindow) -> bool {
        self.min_time <= window.end.timestamp_millis()
            && self.max_time >= window.start.timestamp_millis()
    }
}

/// Block directories under `data_dir` to copy for `window`
pub fn select_blocks(data_dir: &Path, window: &CollectWindow, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
    let mut selected = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let meta_path = path.join("meta.json");
        let Ok(raw) = std::fs::read(&meta_path) else {
            continue;
        };
        let Ok(meta) = serde_json::from_slice::<BlockMeta>(&raw) else {
            debug!(path = %meta_path.display(), "Ignoring unreadable block meta");
            continue;
        };
        if meta.overlaps(window) {
            selected.push(path);
        }
    }

    let head = data_dir.join(HEAD_DIR);
    if head.is_dir() && now - window.end < Duration::hours(HEAD_RETENTION_HOURS) {
        selected.push(head);
    }

    selected.sort();
    Ok(selected)
}
