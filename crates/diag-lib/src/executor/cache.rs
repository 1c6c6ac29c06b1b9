//! Local cache of helper binaries shipped to remote hosts

use crate::error::{DiagError, Result};
use crate::http::HttpFetcher;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Distinguishes temp files of concurrent fills within one process
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifies one build of a helper binary
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HelperSpec {
    pub name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
}

impl HelperSpec {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        os: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Whether this build runs on the local machine
    pub fn is_local_platform(&self) -> bool {
        self.os == std::env::consts::OS && normalize_arch(std::env::consts::ARCH) == self.arch
    }
}

/// Map Rust target arch names onto the `amd64`/`arm64` convention
pub fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Cache rooted at `~/.diag/components`
#[derive(Debug, Clone)]
pub struct HelperCache {
    root: PathBuf,
    mirror: Option<String>,
    sibling_dir: Option<PathBuf>,
    fetcher: HttpFetcher,
    /// One fill per helper build; concurrent callers wait on the same cell
    fills: Arc<DashMap<HelperSpec, Arc<OnceCell<PathBuf>>>>,
}

impl HelperCache {
    pub fn new(root: impl Into<PathBuf>, mirror: Option<String>, fetcher: HttpFetcher) -> Self {
        let sibling_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            root: root.into(),
            mirror: mirror.filter(|m| !m.is_empty()),
            sibling_dir,
            fetcher,
            fills: Arc::new(DashMap::new()),
        }
    }

    /// Look for local-platform helpers in `dir` instead of next to the executable
    pub fn with_sibling_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sibling_dir = Some(dir.into());
        self
    }

    pub fn path_of(&self, spec: &HelperSpec) -> PathBuf {
        self.root
            .join(&spec.name)
            .join(&spec.version)
            .join(format!("{}-{}", spec.os, spec.arch))
            .join(&spec.name)
    }

    /// Return the cached helper, fetching it when missing
    pub async fn download(&self, spec: &HelperSpec, cancel: &CancellationToken) -> Result<PathBuf> {
        let path = self.path_of(spec);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(path);
        }

        let cell = self
            .fills
            .entry(spec.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_try_init(|| self.fill(spec, path, cancel))
            .await
            .cloned()
    }

    async fn fill(&self, spec: &HelperSpec, path: PathBuf, cancel: &CancellationToken) -> Result<PathBuf> {
        // Another process may have filled it meanwhile
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(path);
        }
        let parent = path
            .parent()
            .ok_or_else(|| DiagError::Bug(format!("cache path without parent: {}", path.display())))?;
        tokio::fs::create_dir_all(parent).await?;
        let tmp = parent.join(format!(
            ".{}.{}.{}.tmp",
            spec.name,
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let filled = self.fetch_into(spec, &tmp, cancel).await;
        let filled = match filled {
            Ok(()) => set_executable(&tmp).await,
            Err(e) => Err(e),
        };
        if let Err(e) = filled {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    async fn fetch_into(&self, spec: &HelperSpec, tmp: &Path, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DiagError::Cancelled);
        }
        if let Some(local) = self.sibling(spec).await {
            info!(helper = %spec.name, source = %local.display(), "Caching local helper binary");
            tokio::fs::copy(&local, tmp).await?;
            return Ok(());
        }
        let Some(mirror) = &self.mirror else {
            return Err(DiagError::io_other(format!(
                "helper {} {} for {}/{} is not cached and no mirror is configured",
                spec.name, spec.version, spec.os, spec.arch
            )));
        };
        let url = format!(
            "{}/{}-{}-{}-{}",
            mirror.trim_end_matches('/'),
            spec.name,
            spec.version,
            spec.os,
            spec.arch
        );
        info!(helper = %spec.name, url = %url, "Downloading helper binary");
        self.fetcher
            .download(&url, tmp, &[], Duration::from_secs(300), cancel)
            .await?;
        Ok(())
    }

    async fn sibling(&self, spec: &HelperSpec) -> Option<PathBuf> {
        if !spec.is_local_platform() {
            return None;
        }
        let candidate = self.sibling_dir.as_ref()?.join(&spec.name);
        tokio::fs::metadata(&candidate)
            .await
            .ok()
            .filter(|m| m.is_file())
            .map(|_| candidate)
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
