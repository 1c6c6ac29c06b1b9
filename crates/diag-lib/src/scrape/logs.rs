//! Log file classification by name and first line

use crate::models::CollectWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

/// Longest first line read; the rest of the line is dropped
pub const MAX_HEAD_LINE: usize = 65_536;

const SLOW_LOG_PREFIX: &str = "# Time:";
const STD_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f %:z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Std,
    Slow,
    Unknown,
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Std => "std",
            Self::Slow => "slow",
            Self::Unknown => "unknown",
        })
    }
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "std" => Ok(Self::Std),
            "slow" => Ok(Self::Slow),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown log type '{}'", other)),
        }
    }
}

/// Type of a log file and the time of its first entry, when known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogClass {
    pub log_type: LogType,
    pub head_time: Option<DateTime<Utc>>,
    /// Process stderr and rocksdb info logs are kept whatever their times
    pub always_keep: bool,
}

impl LogClass {
    /// Whether `[head_time, mtime]` intersects the window
    pub fn in_window(&self, mtime: DateTime<Utc>, window: &CollectWindow) -> bool {
        if self.always_keep {
            return true;
        }
        if mtime < window.start {
            return false;
        }
        match self.head_time {
            Some(head) => head <= window.end,
            None => true,
        }
    }
}

/// Parse the leading timestamp of a log line.
///
/// Accepts `[2006/01/02 15:04:05.000 -07:00]` style brackets, a slow-log
/// `# Time: <rfc3339>` header, or a bare leading RFC3339 token.
pub fn parse_head_time(line: &str) -> Option<(LogType, DateTime<Utc>)> {
    let line = line.trim_start();

    if let Some(rest) = line.strip_prefix(SLOW_LOG_PREFIX) {
        let ts = rest.trim();
        return DateTime::parse_from_rfc3339(ts)
            .ok()
            .map(|t| (LogType::Slow, t.with_timezone(&Utc)));
    }

    if let Some(rest) = line.strip_prefix('[') {
        let end = rest.find(']')?;
        return DateTime::parse_from_str(&rest[..end], STD_TIME_FORMAT)
            .ok()
            .map(|t| (LogType::Std, t.with_timezone(&Utc)));
    }

    let token = line.split_whitespace().next()?;
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|t| (LogType::Std, t.with_timezone(&Utc)))
}

fn read_head_line(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file).take(MAX_HEAD_LINE as u64);
    let mut buf = Vec::new();
    reader.read_until(b'\n', &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Decide the type of a log file
pub fn classify_log(path: &Path) -> io::Result<LogClass> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name.contains("stderr") || (name.starts_with("rocksdb") && name.ends_with(".info")) {
        return Ok(LogClass {
            log_type: LogType::Std,
            head_time: None,
            always_keep: true,
        });
    }

    let head = read_head_line(path)?;
    Ok(match parse_head_time(&head) {
        Some((log_type, time)) => LogClass {
            log_type,
            head_time: Some(time),
            always_keep: false,
        },
        None => LogClass {
            log_type: LogType::Unknown,
            head_time: None,
            always_keep: false,
        },
    })
}
