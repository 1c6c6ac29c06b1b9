//! Parallel ranged download of uploaded packages

use super::{check, ClinicClient, BLOCK_SIZE, MAX_CONCURRENT};
use crate::error::{DiagError, Result};
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, RANGE};
use serde::Deserialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const HEAD_TIMEOUT: Duration = Duration::from_secs(30);
const RANGE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub from: u64,
    pub to: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Split `len` bytes into at most [`MAX_CONCURRENT`] ranges of at least `min_range` bytes
pub fn split_ranges(len: u64, min_range: u64) -> Vec<ByteRange> {
    if len == 0 {
        return Vec::new();
    }
    let parts = (len / min_range.max(1)).clamp(1, MAX_CONCURRENT as u64);
    let each = len / parts;
    (0..parts)
        .map(|i| ByteRange {
            from: i * each,
            to: if i == parts - 1 {
                len - 1
            } else {
                (i + 1) * each - 1
            },
        })
        .collect()
}

/// What HEAD reports about a stored package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub uuid: String,
    pub length: u64,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub dest_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct IdList {
    #[serde(alias = "Ids")]
    ids: Vec<String>,
}

/// Split the endpoint and UUID out of a retrieval URL such as
/// `https://host/diag/files?uuid=<id>`
pub fn parse_download_url(url: &str) -> Result<(String, String)> {
    let uuid = url
        .rsplit_once('=')
        .map(|(_, id)| id.to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| DiagError::parse(format!("no file id in url {}", url)))?;
    let endpoint = url
        .find("/diag")
        .map(|i| url[..i].to_string())
        .ok_or_else(|| DiagError::parse(format!("unrecognized download url {}", url)))?;
    Ok((endpoint, uuid))
}

fn disposition_file_name(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        part.strip_prefix("filename=")
            .map(|name| name.trim_matches('"').to_string())
            .filter(|name| !name.is_empty())
    })
}

pub struct Downloader {
    client: ClinicClient,
    range_size: u64,
}

impl Downloader {
    pub fn new(client: ClinicClient) -> Self {
        Self {
            client,
            range_size: BLOCK_SIZE,
        }
    }

    /// Override the minimum range length
    pub fn with_range_size(mut self, bytes: u64) -> Self {
        self.range_size = bytes.max(1);
        self
    }

    fn file_url(&self, uuid: &str) -> String {
        self.client.url(&format!("/api/internal/files/{}", uuid))
    }

    pub async fn head(&self, uuid: &str) -> Result<RemoteFile> {
        let request = self
            .client
            .http()
            .head(self.file_url(uuid))
            .timeout(HEAD_TIMEOUT);
        let response = self.client.authorize(request).send().await?;
        let response = check(response, "head", false).await?;
        let headers = response.headers();

        let ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if ranges != "bytes" {
            return Err(DiagError::ServerReject(
                "server does not support ranged downloads".to_string(),
            ));
        }
        let length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| DiagError::parse("missing content length"))?;
        let file_name = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_file_name)
            .unwrap_or_else(|| uuid.to_string());
        Ok(RemoteFile {
            uuid: uuid.to_string(),
            length,
            file_name,
        })
    }

    /// Download one package into `opts.dest_dir`, resuming a previous `.tmp`
    pub async fn download(
        &self,
        uuid: &str,
        opts: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let remote = self.head(uuid).await?;
        tokio::fs::create_dir_all(&opts.dest_dir).await?;
        let tmp = opts.dest_dir.join(format!("{}.tmp", remote.file_name));

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&tmp)
            .await?;
        if file.metadata().await?.len() < remote.length {
            file.set_len(remote.length).await?;
        }
        drop(file);

        let ranges = split_ranges(remote.length, self.range_size);
        info!(uuid = %uuid, file = %remote.file_name, bytes = remote.length, parts = ranges.len(), "Starting download");

        let job = Arc::new(RangeJob {
            client: self.client.clone(),
            url: self.file_url(uuid),
            tmp: tmp.clone(),
        });
        let mut set = JoinSet::new();
        for range in ranges {
            let job = job.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(DiagError::Cancelled),
                    r = job.fetch(range) => r,
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            joined??;
        }

        let mut target = opts.dest_dir.join(&remote.file_name);
        if tokio::fs::metadata(&target).await.is_ok() {
            let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            target = opts
                .dest_dir
                .join(format!("{}-{}", remote.file_name, stamp));
        }
        tokio::fs::rename(&tmp, &target).await?;
        info!(uuid = %uuid, path = %target.display(), "Download finished");
        Ok(target)
    }

    /// File ids stored under an alias
    pub async fn ids_by_alias(&self, alias: &str) -> Result<Vec<String>> {
        self.list_ids(&format!("/api/internal/files/alias/{}", alias)).await
    }

    /// File ids stored for a cluster
    pub async fn ids_by_cluster(&self, cluster_id: &str) -> Result<Vec<String>> {
        self.list_ids(&format!("/api/internal/files/cluster/{}", cluster_id))
            .await
    }

    async fn list_ids(&self, path: &str) -> Result<Vec<String>> {
        let request = self.client.http().get(self.client.url(path)).timeout(HEAD_TIMEOUT);
        let response = self.client.authorize(request).send().await?;
        let body = check(response, "list files", true).await?.bytes().await?;
        let list: IdList = serde_json::from_slice(&body)?;
        if list.ids.is_empty() {
            return Err(DiagError::ServerReject(format!("no files found at {}", path)));
        }
        Ok(list.ids)
    }
}

struct RangeJob {
    client: ClinicClient,
    url: String,
    tmp: PathBuf,
}

impl RangeJob {
    async fn fetch(&self, range: ByteRange) -> Result<()> {
        if already_written(&self.tmp, range).await? {
            debug!(from = range.from, to = range.to, "Range already present, skipping");
            return Ok(());
        }
        let request = self
            .client
            .http()
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", range.from, range.to))
            .timeout(RANGE_TIMEOUT);
        let response = self.client.authorize(request).send().await?;
        let body = check(response, "range", false).await?.bytes().await?;
        if body.len() as u64 != range.len() {
            return Err(DiagError::Http {
                status: 206,
                body: format!(
                    "range {}-{} returned {} bytes",
                    range.from,
                    range.to,
                    body.len()
                ),
            });
        }

        let mut file = tokio::fs::OpenOptions::new().write(true).open(&self.tmp).await?;
        file.seek(SeekFrom::Start(range.from)).await?;
        file.write_all(&body).await?;
        file.flush().await?;
        debug!(from = range.from, to = range.to, "Range written");
        Ok(())
    }
}

/// A range counts as done when any of its bytes is non-zero
async fn already_written(path: &Path, range: ByteRange) -> Result<bool> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.from)).await?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut left = range.len();
    while left > 0 {
        let want = left.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        if buf[..n].iter().any(|b| *b != 0) {
            return Ok(true);
        }
        left -= n as u64;
    }
    Ok(false)
}
