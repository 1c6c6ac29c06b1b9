//! Remote execution over SSH
//!
//! The [`RemoteExecutor`] runs shell commands, transfers files and manages
//! directories on cluster hosts. Connections are opened lazily through a
//! [`TransportFactory`] and cached per host until [`RemoteExecutor::close_all`].
//!
//! Two transports are provided:
//! - [`BuiltinFactory`]: an in-process SSH client (libssh2)
//! - [`SystemFactory`]: delegates to the local `ssh` / `scp` binaries

mod builtin;
mod cache;
mod system;
mod throttle;

#[cfg(test)]
mod tests;

pub use builtin::BuiltinFactory;
pub use cache::{normalize_arch, HelperCache, HelperSpec};
pub use system::SystemFactory;
pub use throttle::{copy_throttled, Throttle};

use crate::error::{DiagError, Result};
use crate::topology::Cluster;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Which SSH implementation to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshBackend {
    #[default]
    Builtin,
    System,
    /// No SSH access; only HTTP collectors run
    None,
}

impl SshBackend {
    /// Bandwidth limit applied when the user leaves `--limit` negative
    pub fn default_limit_kbps(&self) -> u32 {
        match self {
            Self::System => 100_000,
            _ => 10_000,
        }
    }
}

/// SSH connection settings shared by all hosts
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub password: Option<String>,
    pub passphrase: Option<String>,
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Timeout for a single command
    pub command_timeout: Duration,
    /// Request compression on the SSH stream
    pub compress: bool,
    pub backend: SshBackend,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: "tidb".to_string(),
            identity_file: None,
            password: None,
            passphrase: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(180),
            compress: true,
            backend: SshBackend::Builtin,
        }
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Direction of a file transfer relative to the local machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// local -> remote
    Upload,
    /// remote -> local
    Download,
}

/// A single file copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub src: String,
    pub dst: String,
    pub direction: Direction,
    /// Kbit/s, 0 disables the limit
    pub limit_kbps: u32,
    pub compress: bool,
}

/// An open connection to one host
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a command, returning its output whatever the exit code
    async fn exec(&self, cmd: &str, sudo: bool, timeout: Duration) -> Result<CommandOutput>;

    /// Copy one file, honoring the bandwidth limit and stopping on cancel
    async fn transfer(&self, transfer: &Transfer, cancel: &CancellationToken) -> Result<()>;

    async fn close(&self) {}
}

/// Opens transports to hosts
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, host: &str, port: u16, opts: &SshOptions) -> Result<Arc<dyn Transport>>;
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Wrap a command so it runs as root without prompting
pub fn sudo_wrap(cmd: &str) -> String {
    format!("sudo -H -n bash -c {}", shell_quote(cmd))
}

/// Per-host SSH operations with connection reuse
pub struct RemoteExecutor {
    opts: SshOptions,
    factory: Arc<dyn TransportFactory>,
    ports: DashMap<String, u16>,
    connections: DashMap<String, Arc<OnceCell<Arc<dyn Transport>>>>,
    cache: HelperCache,
}

impl RemoteExecutor {
    /// Create an executor for the hosts of a cluster
    pub fn new(
        cluster: &Cluster,
        opts: SshOptions,
        factory: Arc<dyn TransportFactory>,
        cache: HelperCache,
    ) -> Self {
        let ports = DashMap::new();
        for c in &cluster.components {
            if c.ssh_port != 0 {
                ports.entry(c.host.clone()).or_insert(c.ssh_port);
            }
        }
        Self {
            opts,
            factory,
            ports,
            connections: DashMap::new(),
            cache,
        }
    }

    /// Build the factory matching the configured backend
    pub fn factory_for(backend: SshBackend) -> Option<Arc<dyn TransportFactory>> {
        match backend {
            SshBackend::Builtin => Some(Arc::new(BuiltinFactory)),
            SshBackend::System => Some(Arc::new(SystemFactory)),
            SshBackend::None => None,
        }
    }

    pub fn options(&self) -> &SshOptions {
        &self.opts
    }

    pub fn cache(&self) -> &HelperCache {
        &self.cache
    }

    async fn transport(&self, host: &str) -> Result<Arc<dyn Transport>> {
        let cell = self.connections.entry(host.to_string()).or_default().clone();
        let transport = cell
            .get_or_try_init(|| async {
                let port = self.ports.get(host).map(|p| *p).unwrap_or(22);
                debug!(host = %host, port, "Opening SSH connection");
                self.factory.connect(host, port, &self.opts).await
            })
            .await?;
        Ok(transport.clone())
    }

    /// Run a command and return its captured output, whatever the exit code
    pub async fn shell(&self, host: &str, cmd: &str, sudo: bool) -> Result<CommandOutput> {
        let transport = self.transport(host).await?;
        debug!(host = %host, cmd = %cmd, sudo, "Executing remote command");
        transport.exec(cmd, sudo, self.opts.command_timeout).await
    }

    /// Run a command, turning a non-zero exit into [`DiagError::RemoteExit`]
    pub async fn shell_checked(&self, host: &str, cmd: &str, sudo: bool) -> Result<CommandOutput> {
        let out = self.shell(host, cmd, sudo).await?;
        if !out.success() {
            return Err(DiagError::RemoteExit {
                host: host.to_string(),
                code: out.code,
                stderr: out.stderr_lossy(),
            });
        }
        Ok(out)
    }

    pub async fn mkdir(&self, host: &str, path: &str) -> Result<()> {
        self.shell_checked(host, &format!("mkdir -p {}", shell_quote(path)), false)
            .await
            .map(|_| ())
    }

    pub async fn rmdir(&self, host: &str, path: &str) -> Result<()> {
        self.shell_checked(host, &format!("rm -rf {}", shell_quote(path)), false)
            .await
            .map(|_| ())
    }

    /// Copy a file to or from a host
    pub async fn copy_file(
        &self,
        host: &str,
        transfer: &Transfer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DiagError::Cancelled);
        }
        if transfer.direction == Direction::Download {
            if let Some(parent) = std::path::Path::new(&transfer.dst).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let transport = self.transport(host).await?;
        debug!(
            host = %host,
            src = %transfer.src,
            dst = %transfer.dst,
            direction = ?transfer.direction,
            limit_kbps = transfer.limit_kbps,
            "Copying file"
        );
        transport.transfer(transfer, cancel).await
    }

    /// Place a helper binary on a host, downloading it to the local cache first
    pub async fn copy_component(
        &self,
        host: &str,
        helper: &HelperSpec,
        dst_dir: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let local = self.cache.download(helper, cancel).await?;
        let dst = format!("{}/{}", dst_dir.trim_end_matches('/'), helper.name);
        let transfer = Transfer {
            src: local.to_string_lossy().into_owned(),
            dst: dst.clone(),
            direction: Direction::Upload,
            limit_kbps: 0,
            compress: self.opts.compress,
        };
        self.copy_file(host, &transfer, cancel).await?;
        self.shell_checked(host, &format!("chmod 755 {}", shell_quote(&dst)), false)
            .await?;
        Ok(dst)
    }

    /// Ensure a helper exists in the local cache
    pub async fn download(&self, helper: &HelperSpec, cancel: &CancellationToken) -> Result<PathBuf> {
        self.cache.download(helper, cancel).await
    }

    /// Close every cached connection
    pub async fn close_all(&self) {
        let hosts: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for host in hosts {
            if let Some((_, cell)) = self.connections.remove(&host) {
                if let Some(t) = cell.get() {
                    t.close().await;
                }
            }
        }
        info!("Closed all SSH connections");
    }
}
