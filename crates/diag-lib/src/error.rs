//! Error kinds shared by every stage of a diagnostic run

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, DiagError>;

/// Failure of a discovery, transport, collection, packaging or upload step
#[derive(Debug, Error)]
pub enum DiagError {
    /// The named cluster could not be located by any discovery source
    #[error("cluster not found: {0}")]
    TopologyNotFound(String),

    /// SSH or HTTP credentials were rejected
    #[error("authentication failed for {host}: {message}")]
    AuthFailed { host: String, message: String },

    /// The host or endpoint could not be reached
    #[error("{target} is unreachable: {message}")]
    Unreachable { target: String, message: String },

    /// An operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// A remote command exited with a non-zero status
    #[error("command on {host} exited with code {code}: {stderr}")]
    RemoteExit {
        host: String,
        code: i32,
        stderr: String,
    },

    /// The SSH session was closed before the operation completed
    #[error("connection to {0} closed")]
    TransportClosed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input from a file, a flag, or a remote response
    #[error("parse error: {0}")]
    Parse(String),

    /// An HTTP endpoint answered with an unexpected status
    #[error("http error ({status}): {body}")]
    Http { status: u16, body: String },

    /// The recipient key or certificate is unusable
    #[error("invalid key: {0}")]
    CryptoKey(String),

    /// The upload service refused the request
    #[error("rejected by server: {0}")]
    ServerReject(String),

    #[error("operation cancelled")]
    Cancelled,

    /// An internal invariant was violated
    #[error("internal error: {0}")]
    Bug(String),
}

impl DiagError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn io_other(msg: impl Into<String>) -> Self {
        Self::Io(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
    }

    /// Short stable name of the error kind, recorded in run metadata
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TopologyNotFound(_) => "topologyNotFound",
            Self::AuthFailed { .. } => "authFailed",
            Self::Unreachable { .. } => "unreachable",
            Self::Timeout(_) => "timeout",
            Self::RemoteExit { .. } => "remoteExit",
            Self::TransportClosed(_) => "transportClosed",
            Self::Io(_) => "io",
            Self::Parse(_) => "parse",
            Self::Http { .. } => "http",
            Self::CryptoKey(_) => "cryptoKey",
            Self::ServerReject(_) => "serverReject",
            Self::Cancelled => "cancelled",
            Self::Bug(_) => "bug",
        }
    }
}

impl From<serde_json::Error> for DiagError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for DiagError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for DiagError {
    fn from(err: reqwest::Error) -> Self {
        let target = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "endpoint".to_string());
        if err.is_timeout() {
            Self::Timeout(target)
        } else if err.is_connect() {
            Self::Unreachable {
                target,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))
        }
    }
}

impl From<tokio::task::JoinError> for DiagError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Bug(format!("task panicked: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(DiagError::Cancelled.kind(), "cancelled");
        assert_eq!(
            DiagError::RemoteExit {
                host: "h".into(),
                code: 2,
                stderr: "no such file".into()
            }
            .kind(),
            "remoteExit"
        );
        assert_eq!(DiagError::parse("bad").kind(), "parse");
    }

    #[test]
    fn test_display_includes_context() {
        let err = DiagError::Http {
            status: 503,
            body: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "http error (503): unavailable");
    }
}
