//! Time-bounded HTTP client for component and monitoring endpoints

use crate::error::{DiagError, Result};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// TLS and client settings
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Talk HTTPS to component endpoints
    pub tls: bool,
    /// Extra trusted CA certificate (PEM)
    pub ca_cert: Option<PathBuf>,
    /// Skip server certificate verification
    pub insecure: bool,
}

/// Shared HTTP client; cheap to clone
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    tls: bool,
}

impl HttpFetcher {
    pub fn new(opts: &HttpOptions) -> Result<Self> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .user_agent(concat!("diag/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(opts.insecure);

        if let Some(path) = &opts.ca_cert {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| DiagError::CryptoKey(format!("{}: {}", path.display(), e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| DiagError::Bug(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            tls: opts.tls,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Full URL for `path` on `address` (`host:port`), honoring the TLS setting
    pub fn url(&self, address: &str, path: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            return format!("{}{}", address.trim_end_matches('/'), path);
        }
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, address, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiagError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// GET a URL and return the body; any status outside 2xx is an error
    pub async fn get(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.get_with_headers(url, &[], timeout).await
    }

    pub async fn get_with_headers(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        debug!(url = %url, timeout_secs = timeout.as_secs(), "HTTP GET");
        let mut request = self.client.get(url).timeout(timeout);
        for (k, v) in headers {
            request = request.header(*k, *v);
        }
        let response = self.send(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// POST a form and return the body
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        debug!(url = %url, "HTTP POST form");
        let request = self.client.post(url).form(form).timeout(timeout);
        let response = self.send(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Stream a response body into `dest`, returning the bytes written
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        headers: &[(&str, &str)],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        debug!(url = %url, dest = %dest.display(), "HTTP download");
        let mut request = self.client.get(url).timeout(timeout);
        for (k, v) in headers {
            request = request.header(*k, *v);
        }
        let response = self.send(request).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DiagError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(bytes) => {
                    let bytes = bytes?;
                    file.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                }
                None => break,
            }
        }
        file.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_scheme() {
        let plain = HttpFetcher::new(&HttpOptions::default()).unwrap();
        assert_eq!(
            plain.url("10.0.0.1:2379", "/pd/api/v1/config"),
            "http://10.0.0.1:2379/pd/api/v1/config"
        );
        assert_eq!(
            plain.url("http://127.0.0.1:1234/", "/config"),
            "http://127.0.0.1:1234/config"
        );

        let tls = HttpFetcher::new(&HttpOptions {
            tls: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(tls.url("h:1", "/x"), "https://h:1/x");
    }

    #[tokio::test]
    async fn test_get_maps_status_to_error() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/ok")
            .with_status(200)
            .with_body("fine")
            .create_async()
            .await;
        let bad = server
            .mock("GET", "/bad")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(&HttpOptions::default()).unwrap();
        let body = fetcher
            .get(&format!("{}/ok", server.url()), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(body, b"fine");

        let err = fetcher
            .get(&format!("{}/bad", server.url()), Duration::from_secs(3))
            .await
            .unwrap_err();
        match err {
            DiagError::Http { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "down");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        ok.assert_async().await;
        bad.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_streams_to_file() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/blob")
            .with_status(200)
            .with_body(vec![7u8; 4096])
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("nested").join("blob.bin");
        let fetcher = HttpFetcher::new(&HttpOptions::default()).unwrap();
        let n = fetcher
            .download(
                &format!("{}/blob", server.url()),
                &dest,
                &[],
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(n, 4096);
        assert_eq!(std::fs::read(&dest).unwrap().len(), 4096);
    }
}
