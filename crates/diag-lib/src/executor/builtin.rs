//! In-process SSH transport built on libssh2
//!
//! libssh2 is blocking, so every operation runs on the blocking pool with
//! the session guarded by a mutex.

use super::throttle::{copy_throttled, Throttle};
use super::{sudo_wrap, CommandOutput, Direction, SshOptions, Transfer, Transport, TransportFactory};
use crate::error::{DiagError, Result};
use async_trait::async_trait;
use ssh2::{ErrorCode, Session};
use std::io::{BufReader, BufWriter, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// libssh2 error codes
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

fn map_ssh_err(host: &str, err: ssh2::Error) -> DiagError {
    match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
            DiagError::Timeout(format!("ssh operation on {}", host))
        }
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_RECV | LIBSSH2_ERROR_SOCKET_DISCONNECT,
        ) => DiagError::TransportClosed(host.to_string()),
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => DiagError::AuthFailed {
            host: host.to_string(),
            message: err.message().to_string(),
        },
        _ => DiagError::io_other(format!("ssh error on {}: {}", host, err)),
    }
}

fn map_io_err(host: &str, err: std::io::Error, cancel: &CancellationToken) -> DiagError {
    if cancel.is_cancelled() {
        return DiagError::Cancelled;
    }
    match err.kind() {
        std::io::ErrorKind::TimedOut => DiagError::Timeout(format!("transfer on {}", host)),
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => DiagError::TransportClosed(host.to_string()),
        _ => DiagError::Io(err),
    }
}

/// Connects with the in-process SSH client
pub struct BuiltinFactory;

#[async_trait]
impl TransportFactory for BuiltinFactory {
    async fn connect(&self, host: &str, port: u16, opts: &SshOptions) -> Result<Arc<dyn Transport>> {
        let host = host.to_string();
        let opts = opts.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&host, port, &opts).map(|s| (host, s)))
            .await??;
        Ok(Arc::new(BuiltinTransport {
            host: session.0,
            session: Arc::new(Mutex::new(session.1)),
        }))
    }
}

fn open_session(host: &str, port: u16, opts: &SshOptions) -> Result<Session> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| DiagError::Unreachable {
            target: format!("{}:{}", host, port),
            message: e.to_string(),
        })?
        .next()
        .ok_or_else(|| DiagError::Unreachable {
            target: format!("{}:{}", host, port),
            message: "no address resolved".to_string(),
        })?;

    let tcp = TcpStream::connect_timeout(&addr, opts.connect_timeout).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut {
            DiagError::Timeout(format!("connecting to {}", addr))
        } else {
            DiagError::Unreachable {
                target: addr.to_string(),
                message: e.to_string(),
            }
        }
    })?;

    let mut session = Session::new().map_err(|e| map_ssh_err(host, e))?;
    session.set_compress(opts.compress);
    session.set_tcp_stream(tcp);
    session.set_timeout(opts.connect_timeout.as_millis() as u32);
    session.handshake().map_err(|e| map_ssh_err(host, e))?;

    let auth = if let Some(key) = &opts.identity_file {
        session.userauth_pubkey_file(&opts.user, None, key, opts.passphrase.as_deref())
    } else if let Some(password) = &opts.password {
        session.userauth_password(&opts.user, password)
    } else {
        session.userauth_agent(&opts.user)
    };
    if let Err(e) = auth {
        return Err(DiagError::AuthFailed {
            host: host.to_string(),
            message: e.message().to_string(),
        });
    }
    if !session.authenticated() {
        return Err(DiagError::AuthFailed {
            host: host.to_string(),
            message: format!("user {} was not accepted", opts.user),
        });
    }

    debug!(host = %host, port, user = %opts.user, "SSH session established");
    Ok(session)
}

struct BuiltinTransport {
    host: String,
    session: Arc<Mutex<Session>>,
}

impl BuiltinTransport {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| DiagError::Bug(format!("ssh session mutex poisoned for {}", self.host)))
    }
}

fn exec_blocking(host: &str, session: &Session, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    let mut channel = session.channel_session().map_err(|e| map_ssh_err(host, e))?;
    channel.exec(cmd).map_err(|e| map_ssh_err(host, e))?;

    let mut stdout = Vec::new();
    channel
        .read_to_end(&mut stdout)
        .map_err(|e| map_io_err(host, e, &CancellationToken::new()))?;
    let mut stderr = Vec::new();
    channel
        .stderr()
        .read_to_end(&mut stderr)
        .map_err(|e| map_io_err(host, e, &CancellationToken::new()))?;

    channel.wait_close().map_err(|e| map_ssh_err(host, e))?;
    let code = channel.exit_status().map_err(|e| map_ssh_err(host, e))?;
    Ok(CommandOutput {
        stdout,
        stderr,
        code,
    })
}

fn transfer_blocking(
    host: &str,
    session: &Session,
    transfer: &Transfer,
    cancel: &CancellationToken,
) -> Result<()> {
    let throttle = Throttle::new(transfer.limit_kbps);
    // transfers may outlast any command timeout; rely on cancel instead
    session.set_timeout(0);

    match transfer.direction {
        Direction::Upload => {
            let file = std::fs::File::open(&transfer.src)?;
            let size = file.metadata()?.len();
            let mut remote = session
                .scp_send(Path::new(&transfer.dst), 0o644, size, None)
                .map_err(|e| map_ssh_err(host, e))?;
            copy_throttled(&mut BufReader::new(file), &mut remote, &throttle, cancel)
                .map_err(|e| map_io_err(host, e, cancel))?;
            remote.send_eof().map_err(|e| map_ssh_err(host, e))?;
            remote.wait_eof().map_err(|e| map_ssh_err(host, e))?;
            remote.close().map_err(|e| map_ssh_err(host, e))?;
            remote.wait_close().map_err(|e| map_ssh_err(host, e))?;
        }
        Direction::Download => {
            let (mut remote, _stat) = session
                .scp_recv(Path::new(&transfer.src))
                .map_err(|e| map_ssh_err(host, e))?;
            let file = std::fs::File::create(&transfer.dst)?;
            let mut writer = BufWriter::new(file);
            copy_throttled(&mut remote, &mut writer, &throttle, cancel)
                .map_err(|e| map_io_err(host, e, cancel))?;
            remote.send_eof().map_err(|e| map_ssh_err(host, e))?;
            remote.wait_eof().map_err(|e| map_ssh_err(host, e))?;
            remote.close().map_err(|e| map_ssh_err(host, e))?;
            remote.wait_close().map_err(|e| map_ssh_err(host, e))?;
        }
    }
    Ok(())
}

#[async_trait]
impl Transport for BuiltinTransport {
    async fn exec(&self, cmd: &str, sudo: bool, timeout: Duration) -> Result<CommandOutput> {
        let cmd = if sudo { sudo_wrap(cmd) } else { cmd.to_string() };
        let host = self.host.clone();
        let session = self.session.clone();

        let task = tokio::task::spawn_blocking(move || {
            let guard = session
                .lock()
                .map_err(|_| DiagError::Bug(format!("ssh session mutex poisoned for {}", host)))?;
            exec_blocking(&host, &guard, &cmd, timeout)
        });

        // libssh2 enforces the timeout itself; the outer bound covers lock waits
        match tokio::time::timeout(timeout + Duration::from_secs(5), task).await {
            Ok(joined) => joined?,
            Err(_) => Err(DiagError::Timeout(format!("command on {}", self.host))),
        }
    }

    async fn transfer(&self, transfer: &Transfer, cancel: &CancellationToken) -> Result<()> {
        let host = self.host.clone();
        let session = self.session.clone();
        let transfer = transfer.clone();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            let guard = session
                .lock()
                .map_err(|_| DiagError::Bug(format!("ssh session mutex poisoned for {}", host)))?;
            transfer_blocking(&host, &guard, &transfer, &cancel)
        })
        .await?
    }

    async fn close(&self) {
        if let Ok(session) = self.lock() {
            let _ = session.disconnect(None, "collection finished", None);
        }
    }
}
