//! `upload`, `download` and `history`

use crate::config::Config;
use crate::output::{self, print_info, print_success, OutputFormat};
use crate::Cli;
use anyhow::{bail, Context, Result};
use diag_lib::http::{HttpFetcher, HttpOptions};
use diag_lib::upload::{
    parse_download_url, ClinicClient, DownloadOptions, Downloader, History, UploadOptions, Uploader,
};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use tabled::Tabled;
use tokio_util::sync::CancellationToken;

/// What `download` was asked to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    /// A single file, with the endpoint taken from its URL when one was given
    Uuid {
        endpoint: Option<String>,
        uuid: String,
    },
    Alias(String),
    Cluster(String),
}

impl DownloadTarget {
    /// Exactly one of the selectors must be set
    pub fn from_args(
        url: Option<&str>,
        uuid: Option<&str>,
        alias: Option<&str>,
        cluster_id: Option<&str>,
    ) -> Result<Self> {
        let given = [url, uuid, alias, cluster_id].iter().filter(|v| v.is_some()).count();
        if given != 1 {
            bail!("Specify exactly one of <url>, --uuid, --alias or --cluster-id");
        }
        if let Some(url) = url {
            let (endpoint, uuid) = parse_download_url(url)?;
            return Ok(Self::Uuid {
                endpoint: Some(endpoint),
                uuid,
            });
        }
        if let Some(uuid) = uuid {
            return Ok(Self::Uuid {
                endpoint: None,
                uuid: uuid.to_string(),
            });
        }
        if let Some(alias) = alias {
            return Ok(Self::Alias(alias.to_string()));
        }
        match cluster_id {
            Some(id) => Ok(Self::Cluster(id.to_string())),
            None => bail!("Nothing to download"),
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted");
            signal.cancel();
        }
    });
    cancel
}

fn clinic_client(config: &Config, endpoint: Option<String>) -> Result<ClinicClient> {
    let fetcher = HttpFetcher::new(&HttpOptions::default())?;
    let endpoint = endpoint.unwrap_or_else(|| config.endpoint());
    Ok(ClinicClient::new(
        fetcher.client().clone(),
        endpoint,
        config.token(),
    ))
}

pub async fn upload(
    cli: &Cli,
    home: &Path,
    file: &Path,
    alias: Option<String>,
    issue: Option<String>,
    endpoint: Option<String>,
) -> Result<()> {
    let config = Config::load(home)?;
    if config.token().is_empty() {
        bail!("No upload token configured, run `diag config clinic.token <token>` first");
    }
    let client = clinic_client(&config, endpoint)?;

    let mut opts = UploadOptions::new(file);
    opts.alias = alias;
    opts.issue = issue;
    opts.concurrency = cli.concurrency.max(1);

    let cancel = cancel_on_ctrl_c();
    let url = Uploader::new(client)
        .with_history(home)
        .upload(&opts, &cancel)
        .await
        .with_context(|| format!("Failed to upload {}", file.display()))?;

    match cli.format {
        OutputFormat::Json => output::print_json(&json!({ "url": url })),
        OutputFormat::Default => {
            print_success("Upload completed");
            print_info(&format!("Download URL: {}", url));
        }
    }
    Ok(())
}

pub async fn download(
    format: OutputFormat,
    home: &Path,
    target: DownloadTarget,
    endpoint: Option<String>,
    output_dir: &Path,
) -> Result<()> {
    let config = Config::load(home)?;
    let (endpoint, ids) = match target {
        DownloadTarget::Uuid {
            endpoint: from_url,
            uuid,
        } => (endpoint.or(from_url), vec![uuid]),
        DownloadTarget::Alias(alias) => {
            let downloader = Downloader::new(clinic_client(&config, endpoint.clone())?);
            (endpoint, downloader.ids_by_alias(&alias).await?)
        }
        DownloadTarget::Cluster(id) => {
            let downloader = Downloader::new(clinic_client(&config, endpoint.clone())?);
            (endpoint, downloader.ids_by_cluster(&id).await?)
        }
    };

    let downloader = Downloader::new(clinic_client(&config, endpoint)?);
    let opts = DownloadOptions {
        dest_dir: output_dir.to_path_buf(),
    };
    let cancel = cancel_on_ctrl_c();
    let mut paths = Vec::with_capacity(ids.len());
    for uuid in &ids {
        let path = downloader
            .download(uuid, &opts, &cancel)
            .await
            .with_context(|| format!("Failed to download {}", uuid))?;
        if format == OutputFormat::Default {
            print_success(&format!("Downloaded {} to {}", uuid, path.display()));
        }
        paths.push(path);
    }

    if format == OutputFormat::Json {
        output::print_json(&json!({ "files": paths }));
    }
    Ok(())
}

#[derive(Tabled, Serialize)]
struct HistoryRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "URL")]
    url: String,
}

pub fn history(format: OutputFormat, home: &Path) -> Result<()> {
    let history = History::load(home)?;
    let rows: Vec<HistoryRow> = history
        .entries()
        .iter()
        .enumerate()
        .map(|(i, url)| HistoryRow {
            index: i + 1,
            url: url.clone(),
        })
        .collect();
    output::print_table(&rows, format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_target_carries_endpoint() {
        let target = DownloadTarget::from_args(
            Some("https://clinic.example.com/diag/files?uuid=abc-123"),
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            target,
            DownloadTarget::Uuid {
                endpoint: Some("https://clinic.example.com".to_string()),
                uuid: "abc-123".to_string(),
            }
        );
    }

    #[test]
    fn test_selectors_are_exclusive() {
        assert!(DownloadTarget::from_args(None, None, None, None).is_err());
        assert!(DownloadTarget::from_args(None, Some("a"), Some("b"), None).is_err());
        assert_eq!(
            DownloadTarget::from_args(None, None, None, Some("7000")).unwrap(),
            DownloadTarget::Cluster("7000".to_string())
        );
        assert_eq!(
            DownloadTarget::from_args(None, None, Some("incident-42"), None).unwrap(),
            DownloadTarget::Alias("incident-42".to_string())
        );
    }
}
