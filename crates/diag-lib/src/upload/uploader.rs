use super::{check, ClinicClient, History, BLOCK_SIZE, MAX_CONCURRENT};
use crate::error::{DiagError, Result};
use crate::packager::{package_uuid, read_header};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(600);

/// Server answer to pre-create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PreCreate {
    /// Chunks the server already holds
    #[serde(alias = "Partseq", alias = "partseq", default)]
    pub sequence: u64,
    #[serde(alias = "BlockBytes", alias = "blockBytes")]
    pub blockbytes: u64,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub file: PathBuf,
    pub alias: Option<String>,
    pub issue: Option<String>,
    pub concurrency: usize,
}

impl UploadOptions {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            alias: None,
            issue: None,
            concurrency: 5,
        }
    }
}

/// Number of `block`-sized chunks in `len` bytes
pub fn chunk_count(len: u64, block: u64) -> u64 {
    if block == 0 {
        return 0;
    }
    len.div_ceil(block)
}

#[derive(Debug, Deserialize)]
struct FlushResponse {
    result: String,
}

/// Resumable chunked uploader
pub struct Uploader {
    client: ClinicClient,
    history: Option<PathBuf>,
}

impl Uploader {
    pub fn new(client: ClinicClient) -> Self {
        Self {
            client,
            history: None,
        }
    }

    /// Record returned URLs in the history kept in `dir`
    pub fn with_history(mut self, dir: impl Into<PathBuf>) -> Self {
        self.history = Some(dir.into());
        self
    }

    async fn precreate(
        &self,
        uuid: &str,
        body_len: u64,
        file_name: &str,
        alias: &str,
        header: &crate::packager::PackageHeader,
    ) -> Result<PreCreate> {
        let length = body_len.to_string();
        let request = self
            .client
            .http()
            .post(self.client.url("/clinic/api/v1/diag/precreate"))
            .query(&[
                ("uuid", uuid),
                ("length", length.as_str()),
                ("alias", alias),
                ("filename", file_name),
                ("encryption", header.encryption.as_str()),
                ("compression", header.compression.as_str()),
            ])
            .body(serde_json::to_vec(header)?)
            .timeout(REQUEST_TIMEOUT);
        let response = self.client.authorize(request).send().await?;
        let response = check(response, "precreate", true).await?;
        let pre: PreCreate = serde_json::from_slice(&response.bytes().await?)?;
        if pre.blockbytes == 0 || pre.blockbytes > BLOCK_SIZE {
            return Err(DiagError::ServerReject(format!(
                "precreate: unusable block size {}",
                pre.blockbytes
            )));
        }
        Ok(pre)
    }

    async fn flush(&self, uuid: &str, issue: &str) -> Result<String> {
        let request = self
            .client
            .http()
            .post(self.client.url("/clinic/api/v1/diag/flush"))
            .query(&[("uuid", uuid), ("issue", issue)])
            .timeout(REQUEST_TIMEOUT);
        let response = self.client.authorize(request).send().await?;
        let body = check(response, "flush", true).await?.text().await?;
        let url = match serde_json::from_str::<FlushResponse>(&body) {
            Ok(parsed) => parsed.result,
            Err(_) => body.trim().to_string(),
        };
        Ok(url)
    }

    /// Upload a package and return the retrieval URL
    pub async fn upload(&self, opts: &UploadOptions, cancel: &CancellationToken) -> Result<String> {
        let meta = tokio::fs::metadata(&opts.file).await?;
        if !meta.is_file() {
            return Err(DiagError::parse(format!("{} is not a package file", opts.file.display())));
        }
        let alias = opts.alias.clone().unwrap_or_default();
        let uuid = package_uuid(&opts.file, Some(alias.as_str()))?;
        let (header, offset) = read_header(&opts.file)?;
        let body_len = meta.len().saturating_sub(offset);
        let file_name = opts
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let pre = self
            .precreate(&uuid, body_len, &file_name, &alias, &header)
            .await?;
        let total = chunk_count(body_len, pre.blockbytes);
        info!(
            file = %opts.file.display(),
            uuid = %uuid,
            total_chunks = total,
            acknowledged = pre.sequence,
            block_bytes = pre.blockbytes,
            "Starting upload"
        );

        if total > pre.sequence {
            self.upload_chunks(opts, &uuid, offset, body_len, pre, cancel)
                .await?;
        }

        let url = self
            .flush(&uuid, opts.issue.as_deref().unwrap_or_default())
            .await?;
        info!(uuid = %uuid, url = %url, "Upload completed");

        if let Some(dir) = &self.history {
            let mut history = History::load(dir)?;
            history.push(&url);
            history.store()?;
        }
        Ok(url)
    }

    async fn upload_chunks(
        &self,
        opts: &UploadOptions,
        uuid: &str,
        offset: u64,
        body_len: u64,
        pre: PreCreate,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = chunk_count(body_len, pre.blockbytes);
        let workers = opts.concurrency.clamp(1, MAX_CONCURRENT) as u64;
        let cancel = cancel.child_token();
        let shared = Arc::new(ChunkJob {
            client: self.client.clone(),
            file: opts.file.clone(),
            uuid: uuid.to_string(),
            offset,
            body_len,
            block: pre.blockbytes,
        });

        let mut set = JoinSet::new();
        for w in 0..workers {
            let job = shared.clone();
            let cancel = cancel.clone();
            let first = pre.sequence + w;
            set.spawn(async move {
                let mut i = first;
                while i < total {
                    if cancel.is_cancelled() {
                        return Err(DiagError::Cancelled);
                    }
                    job.send(i).await?;
                    i += workers;
                }
                Ok(())
            });
        }

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            let result = joined.map_err(DiagError::from).and_then(|r| r);
            if let Err(e) = result {
                cancel.cancel();
                if first_err.is_none() || matches!(first_err, Some(DiagError::Cancelled)) {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => {
                error!(uuid = %uuid, error = %e, "Upload aborted");
                Err(e)
            }
            None => Ok(()),
        }
    }
}

struct ChunkJob {
    client: ClinicClient,
    file: PathBuf,
    uuid: String,
    offset: u64,
    body_len: u64,
    block: u64,
}

impl ChunkJob {
    /// Upload zero-based chunk `i` as sequence `i + 1`
    async fn send(&self, i: u64) -> Result<()> {
        let start = i * self.block;
        let size = self.block.min(self.body_len - start);
        let data = read_range(&self.file, self.offset + start, size).await?;
        let sequence = i + 1;
        debug!(uuid = %self.uuid, sequence, size, "Uploading chunk");

        let seq = sequence.to_string();
        let len = size.to_string();
        let request = self
            .client
            .http()
            .post(self.client.url("/clinic/api/v1/diag/upload"))
            .query(&[
                ("uuid", self.uuid.as_str()),
                ("sequence", seq.as_str()),
                ("length", len.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .timeout(CHUNK_TIMEOUT);
        let response = self.client.authorize(request).send().await?;
        check(response, &format!("chunk {}", sequence), true).await?;
        Ok(())
    }
}

async fn read_range(path: &Path, at: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(at)).await?;
    let mut data = vec![0u8; len as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}
