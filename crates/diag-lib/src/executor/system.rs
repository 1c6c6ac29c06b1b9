//! Transport delegating to the local `ssh` and `scp` binaries

use super::{sudo_wrap, CommandOutput, Direction, SshOptions, Transfer, Transport, TransportFactory};
use crate::error::{DiagError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exit status ssh uses for its own failures
const SSH_FAILURE: i32 = 255;

/// Spawns `ssh`/`scp` per operation
pub struct SystemFactory;

#[async_trait]
impl TransportFactory for SystemFactory {
    async fn connect(&self, host: &str, port: u16, opts: &SshOptions) -> Result<Arc<dyn Transport>> {
        let transport = SystemTransport {
            host: host.to_string(),
            port,
            opts: opts.clone(),
        };
        // fail early on unreachable hosts and rejected keys
        let check = transport.exec("true", false, opts.connect_timeout * 2).await?;
        if !check.success() {
            return Err(DiagError::RemoteExit {
                host: host.to_string(),
                code: check.code,
                stderr: check.stderr_lossy(),
            });
        }
        Ok(Arc::new(transport))
    }
}

struct SystemTransport {
    host: String,
    port: u16,
    opts: SshOptions,
}

impl SystemTransport {
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.opts.connect_timeout.as_secs().max(1)),
        ];
        // only pass -i when the user set an identity file
        if let Some(key) = &self.opts.identity_file {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        args
    }

    fn login(&self) -> String {
        format!("{}@{}", self.opts.user, self.host)
    }

    fn classify_failure(&self, out: &CommandOutput) -> Option<DiagError> {
        if out.code != SSH_FAILURE {
            return None;
        }
        let stderr = out.stderr_lossy();
        if stderr.contains("Permission denied") || stderr.contains("Authentication failed") {
            Some(DiagError::AuthFailed {
                host: self.host.clone(),
                message: stderr,
            })
        } else if stderr.contains("Connection closed") || stderr.contains("Broken pipe") {
            Some(DiagError::TransportClosed(self.host.clone()))
        } else if stderr.contains("timed out") {
            Some(DiagError::Timeout(format!("ssh to {}", self.host)))
        } else {
            Some(DiagError::Unreachable {
                target: self.host.clone(),
                message: stderr,
            })
        }
    }
}

async fn run(mut cmd: Command, timeout: Duration, cancel: Option<&CancellationToken>) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn()?;
    let wait = child.wait_with_output();

    let output = match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => return Err(DiagError::Cancelled),
            out = tokio::time::timeout(timeout, wait) => out,
        },
        None => tokio::time::timeout(timeout, wait).await,
    };

    let output = output.map_err(|_| DiagError::Timeout("ssh subprocess".to_string()))??;
    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        code: output.status.code().unwrap_or(-1),
    })
}

#[async_trait]
impl Transport for SystemTransport {
    async fn exec(&self, cmd: &str, sudo: bool, timeout: Duration) -> Result<CommandOutput> {
        let remote = if sudo { sudo_wrap(cmd) } else { cmd.to_string() };
        let mut command = Command::new("ssh");
        command
            .args(self.common_args())
            .arg("-p")
            .arg(self.port.to_string())
            .arg(self.login())
            .arg(&remote);

        let out = run(command, timeout, None).await?;
        match self.classify_failure(&out) {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    async fn transfer(&self, transfer: &Transfer, cancel: &CancellationToken) -> Result<()> {
        let mut command = Command::new("scp");
        command
            .args(self.common_args())
            .arg("-P")
            .arg(self.port.to_string());
        if transfer.compress {
            command.arg("-C");
        }
        if transfer.limit_kbps > 0 {
            command.arg("-l").arg(transfer.limit_kbps.to_string());
        }

        let remote = |path: &str| format!("{}:{}", self.login(), path);
        match transfer.direction {
            Direction::Upload => command.arg(&transfer.src).arg(remote(&transfer.dst)),
            Direction::Download => command.arg(remote(&transfer.src)).arg(&transfer.dst),
        };

        debug!(host = %self.host, src = %transfer.src, dst = %transfer.dst, "Running scp");
        // transfers are bounded by cancellation, not by the command timeout
        let out = run(command, Duration::from_secs(24 * 3600), Some(cancel)).await?;
        if let Some(err) = self.classify_failure(&out) {
            return Err(err);
        }
        if !out.success() {
            return Err(DiagError::RemoteExit {
                host: self.host.clone(),
                code: out.code,
                stderr: out.stderr_lossy(),
            });
        }
        Ok(())
    }
}
