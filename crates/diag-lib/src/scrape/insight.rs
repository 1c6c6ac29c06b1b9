//! System snapshot taken by `scraper insight`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub model: String,
    pub logical_cores: usize,
    pub physical_cores: usize,
    pub sockets: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInfo {
    pub name: String,
    /// Mb/s, absent for virtual interfaces
    pub speed_mbps: Option<i64>,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NtpInfo {
    pub source: String,
    pub synchronized: bool,
    /// Offset to the reference clock in milliseconds
    pub offset_ms: Option<f64>,
}

/// Everything the helper reports about a host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightSnapshot {
    pub hostname: String,
    pub os_release: BTreeMap<String, String>,
    pub kernel: String,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disks: Vec<DiskInfo>,
    pub network: Vec<NetInfo>,
    pub ntp: Option<NtpInfo>,
    pub transparent_hugepage: Option<String>,
    pub sysctl: BTreeMap<String, String>,
}

/// Kernel tunables worth surfacing without the full `sysctl -a`
const SYSCTL_KEYS: [&str; 6] = [
    "vm.swappiness",
    "vm.overcommit_memory",
    "net.core.somaxconn",
    "net.ipv4.tcp_syncookies",
    "fs.file-max",
    "kernel.pid_max",
];

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn run(cmd: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cmd).args(args).output().ok()?;
    if !out.status.success() {
        debug!(cmd = %cmd, code = ?out.status.code(), "Command failed");
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Parse `/etc/os-release` style `KEY="value"` lines
pub fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect()
}

/// Parse `/proc/cpuinfo`
pub fn parse_cpuinfo(content: &str) -> CpuInfo {
    let mut info = CpuInfo::default();
    let mut cores = std::collections::BTreeSet::new();
    let mut sockets = std::collections::BTreeSet::new();
    let mut physical_id = String::new();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "processor" => info.logical_cores += 1,
            "model name" if info.model.is_empty() => info.model = value.to_string(),
            "physical id" => {
                physical_id = value.to_string();
                sockets.insert(value.to_string());
            }
            "core id" => {
                cores.insert((physical_id.clone(), value.to_string()));
            }
            _ => {}
        }
    }
    info.sockets = sockets.len().max(1);
    info.physical_cores = if cores.is_empty() {
        info.logical_cores
    } else {
        cores.len()
    };
    info
}

/// Parse `/proc/meminfo`
pub fn parse_meminfo(content: &str) -> MemoryInfo {
    let mut info = MemoryInfo::default();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kib: u64 = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let bytes = kib * 1024;
        match key.trim() {
            "MemTotal" => info.total_bytes = bytes,
            "MemAvailable" => info.available_bytes = bytes,
            "SwapTotal" => info.swap_total_bytes = bytes,
            "SwapFree" => info.swap_free_bytes = bytes,
            _ => {}
        }
    }
    info
}

/// Parse `df -kPT` output
pub fn parse_df(content: &str) -> Vec<DiskInfo> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 7 {
                return None;
            }
            let kib = |s: &str| s.parse::<u64>().ok().map(|v| v * 1024);
            Some(DiskInfo {
                device: cols[0].to_string(),
                fs_type: cols[1].to_string(),
                total_bytes: kib(cols[2])?,
                used_bytes: kib(cols[3])?,
                mount_point: cols[6].to_string(),
            })
        })
        .filter(|d| !matches!(d.fs_type.as_str(), "tmpfs" | "devtmpfs" | "overlay" | "squashfs"))
        .collect()
}

/// Parse `chronyc tracking`
pub fn parse_chrony(content: &str) -> NtpInfo {
    let mut info = NtpInfo {
        source: "chrony".to_string(),
        ..Default::default()
    };
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Leap status" => info.synchronized = value.trim() == "Normal",
            "System time" => {
                // "0.000012 seconds fast of NTP time"
                let mut parts = value.split_whitespace();
                if let Some(secs) = parts.next().and_then(|v| v.parse::<f64>().ok()) {
                    let sign = if value.contains("slow") { -1.0 } else { 1.0 };
                    info.offset_ms = Some(sign * secs * 1000.0);
                }
            }
            _ => {}
        }
    }
    info
}

/// Parse `ntpq -p`; the selected peer is marked with `*`
pub fn parse_ntpq(content: &str) -> NtpInfo {
    let mut info = NtpInfo {
        source: "ntpd".to_string(),
        ..Default::default()
    };
    for line in content.lines() {
        if let Some(peer) = line.strip_prefix('*') {
            let cols: Vec<&str> = peer.split_whitespace().collect();
            info.synchronized = true;
            info.offset_ms = cols.get(8).and_then(|v| v.parse().ok());
        }
    }
    info
}

fn network() -> Vec<NetInfo> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    let mut out: Vec<NetInfo> = entries
        .flatten()
        .map(|e| {
            let path = e.path();
            NetInfo {
                name: e.file_name().to_string_lossy().into_owned(),
                speed_mbps: read_trimmed(path.join("speed")).and_then(|s| s.parse().ok()),
                mtu: read_trimmed(path.join("mtu")).and_then(|s| s.parse().ok()),
            }
        })
        .filter(|n| n.name != "lo")
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn ntp() -> Option<NtpInfo> {
    if let Some(out) = run("chronyc", &["tracking"]) {
        return Some(parse_chrony(&out));
    }
    run("ntpq", &["-p"]).map(|out| parse_ntpq(&out))
}

fn sysctl_highlights() -> BTreeMap<String, String> {
    SYSCTL_KEYS
        .iter()
        .filter_map(|key| {
            let path = format!("/proc/sys/{}", key.replace('.', "/"));
            read_trimmed(path).map(|v| (key.to_string(), v))
        })
        .collect()
}

impl InsightSnapshot {
    /// Collect a snapshot of the local machine; missing sources are left empty
    pub fn collect() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            os_release: read_trimmed("/etc/os-release")
                .map(|s| parse_os_release(&s))
                .unwrap_or_default(),
            kernel: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
            cpu: read_trimmed("/proc/cpuinfo")
                .map(|s| parse_cpuinfo(&s))
                .unwrap_or_default(),
            memory: read_trimmed("/proc/meminfo")
                .map(|s| parse_meminfo(&s))
                .unwrap_or_default(),
            disks: run("df", &["-kPT"]).map(|s| parse_df(&s)).unwrap_or_default(),
            network: network(),
            ntp: ntp(),
            transparent_hugepage: read_trimmed("/sys/kernel/mm/transparent_hugepage/enabled"),
            sysctl: sysctl_highlights(),
        }
    }
}
