//! Deterministic package identifiers used to resume uploads
//!
//! The hashes are FNV-1 (multiply, then xor), so a package gets the same id
//! from every client talking to the service.

use crate::error::Result;
use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use std::fmt::Display;
use std::path::Path;

const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 64-bit FNV-1
pub const fn fnv64(raw: &[u8]) -> u64 {
    let mut hash = FNV64_OFFSET;
    let mut i = 0;
    while i < raw.len() {
        hash = hash.wrapping_mul(FNV64_PRIME);
        hash ^= raw[i] as u64;
        i += 1;
    }
    hash
}

/// 64-bit FNV-1 as lowercase hex
pub fn fnv64_hex(raw: &str) -> String {
    format!("{:x}", fnv64(raw.as_bytes()))
}

/// 32-bit FNV-1
pub const fn fnv32(raw: &[u8]) -> u32 {
    let mut hash = FNV32_OFFSET;
    let mut i = 0;
    while i < raw.len() {
        hash = hash.wrapping_mul(FNV32_PRIME);
        hash ^= raw[i] as u32;
        i += 1;
    }
    hash
}

/// `fnv64(name)-fnv64(size)-fnv64(mtime)[-fnv32(alias)]`
///
/// `mtime` is rendered as RFC3339 in its own offset, `Z` for UTC.
pub fn uuid_from<Tz>(name: &str, size: u64, mtime: DateTime<Tz>, alias: Option<&str>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut id = format!(
        "{}-{}-{}",
        fnv64_hex(name),
        fnv64_hex(&size.to_string()),
        fnv64_hex(&mtime.to_rfc3339_opts(SecondsFormat::Secs, true))
    );
    if let Some(alias) = alias.filter(|a| !a.is_empty()) {
        id.push_str(&format!("-{:x}", fnv32(alias.as_bytes())));
    }
    id
}

/// UUID of a package file on disk, with its mtime in the local offset
pub fn package_uuid(path: &Path, alias: Option<&str>) -> Result<String> {
    let meta = std::fs::metadata(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mtime: DateTime<Local> = meta.modified()?.into();
    Ok(uuid_from(&name, meta.len(), mtime, alias))
}
