//! `package` and `unpack`

use crate::config::Config;
use crate::output::{self, print_info, print_success, print_warning, OutputFormat};
use anyhow::{Context, Result};
use diag_lib::packager::{self, PackageOptions};
use serde_json::json;
use std::path::{Path, PathBuf};

pub async fn package(
    format: OutputFormat,
    home: &Path,
    dir: &Path,
    output: Option<PathBuf>,
    cert: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load(home)?;
    let recipient = cert.or(config.clinic.cert);
    if recipient.is_none() && format == OutputFormat::Default {
        print_warning("No recipient certificate configured, the package will not be encrypted");
    }

    let mut opts = PackageOptions::new(dir);
    opts.output = output;
    opts.recipient = recipient;
    let encrypted = opts.recipient.is_some();

    let path = packager::package_blocking(opts)
        .await
        .with_context(|| format!("Failed to package {}", dir.display()))?;
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or_default();

    match format {
        OutputFormat::Json => output::print_json(&json!({
            "package": path,
            "bytes": size,
            "encrypted": encrypted,
        })),
        OutputFormat::Default => {
            print_success(&format!(
                "Packaged data to {} ({})",
                path.display(),
                output::format_bytes(size)
            ));
            print_info(&format!("Run `diag upload {}` to upload it", path.display()));
        }
    }
    Ok(())
}

/// `cluster-a.diag` unpacks into `cluster-a`
fn default_unpack_dir(package: &Path) -> PathBuf {
    let stem = package
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "unpacked".into());
    PathBuf::from(stem)
}

pub async fn unpack(
    format: OutputFormat,
    package: &Path,
    key: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<()> {
    let out_dir = output.unwrap_or_else(|| default_unpack_dir(package));
    let src = package.to_path_buf();
    let dst = out_dir.clone();
    let header = tokio::task::spawn_blocking(move || packager::unpack(&src, key.as_deref(), &dst))
        .await
        .context("Unpack task failed")?
        .with_context(|| format!("Failed to unpack {}", package.display()))?;

    match format {
        OutputFormat::Json => output::print_json(&json!({
            "output": out_dir,
            "header": header,
        })),
        OutputFormat::Default => {
            print_success(&format!(
                "Unpacked {} into {}",
                package.display(),
                out_dir.display()
            ));
            print_info(&format!(
                "Cluster {} ({}), encryption {}, compression {}",
                header.cluster_id,
                header.cluster_type,
                header.encryption.as_str(),
                header.compression.as_str()
            ));
        }
    }
    Ok(())
}
