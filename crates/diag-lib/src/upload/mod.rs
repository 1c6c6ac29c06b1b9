//! Client of the diagnostic analysis service
//!
//! Packages are uploaded in server-sized chunks keyed by a deterministic UUID,
//! so an interrupted upload resumes where the server stopped acknowledging.
//! Downloads split the file into ranges fetched in parallel.

mod download;
mod history;
mod uploader;

#[cfg(test)]
mod tests;

pub use download::{
    parse_download_url, split_ranges, ByteRange, DownloadOptions, Downloader, RemoteFile,
};
pub use history::{History, HISTORY_LIMIT};
pub use uploader::{chunk_count, PreCreate, UploadOptions, Uploader};

use crate::error::{DiagError, Result};
use crate::models::DIAG_VERSION;
use reqwest::{RequestBuilder, Response, StatusCode};

/// Most parallel chunk uploads or ranged downloads
pub const MAX_CONCURRENT: usize = 10;
/// Largest accepted chunk size and the download range size
pub const BLOCK_SIZE: u64 = 50 * 1024 * 1024;

/// Endpoint and credentials of the service
#[derive(Debug, Clone)]
pub struct ClinicClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl ClinicClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Attach client identification and the bearer token
    pub(crate) fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header("x-clinic-client", "upload")
            .header("x-diag-version", DIAG_VERSION);
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Map a service response onto the error kinds; `strict` accepts only 200
pub(crate) async fn check(response: Response, what: &str, strict: bool) -> Result<Response> {
    let status = response.status();
    let ok = if strict {
        status == StatusCode::OK
    } else {
        status.is_success()
    };
    if ok {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => DiagError::AuthFailed {
            host: what.to_string(),
            message: if body.is_empty() {
                "token rejected".to_string()
            } else {
                body
            },
        },
        StatusCode::FORBIDDEN => DiagError::ServerReject(format!("{}: forbidden", what)),
        StatusCode::BAD_REQUEST => DiagError::ServerReject(format!("{}: {}", what, body)),
        _ => DiagError::Http {
            status: status.as_u16(),
            body: format!("{}: {}", what, body),
        },
    })
}
