use thiserror::Error;

use crate::status::{Code, Status};

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The channel could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS material was rejected or is incomplete.
    #[error("tls configuration rejected: {0}")]
    Tls(String),

    /// The switch answered with a non-OK status.
    #[error("rpc failed with {0}")]
    Status(Status),

    /// The channel was closed locally or by the peer.
    #[error("channel closed")]
    Closed,

    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    pub fn status(code: Code, message: impl Into<String>) -> Self {
        Self::Status(Status::new(code, message))
    }

    /// Canonical code describing this failure.
    pub fn code(&self) -> Code {
        match self {
            Self::ConnectionFailed(_) | Self::Tls(_) | Self::Closed => Code::Unavailable,
            Self::Status(status) => status.code,
            Self::Timeout { .. } => Code::DeadlineExceeded,
        }
    }

    /// True when the failure is the ordinary shape of a dropped connection.
    pub fn is_unavailable(&self) -> bool {
        self.code() == Code::Unavailable
    }

    pub fn is_unimplemented(&self) -> bool {
        self.code() == Code::Unimplemented
    }
}

impl From<Status> for TransportError {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_level_failures_map_to_unavailable() {
        assert!(TransportError::Closed.is_unavailable());
        assert!(TransportError::ConnectionFailed("refused".into()).is_unavailable());
        assert!(!TransportError::status(Code::NotFound, "missing").is_unavailable());
        assert_eq!(
            TransportError::Timeout { elapsed_ms: 10 }.code(),
            Code::DeadlineExceeded
        );
    }
}
