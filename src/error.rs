//! Error types for the banter-link client library.
//!
//! Every failure surfaced by this crate is a [`BanterLinkError`]. Recoverable
//! conditions (rate limits, transient network faults, single malformed
//! frames) are absorbed inside the command queue and listener; only permanent
//! rejections and exhausted retries reach the caller.

use std::time::Duration;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BanterLinkError>;

/// All errors produced by the banter-link client.
#[derive(Debug, thiserror::Error)]
pub enum BanterLinkError {
    /// The platform rejected the supplied identity/secret pair. Fatal; do not
    /// retry with the same credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    /// The session-validity probe could not be completed. Transient; callers
    /// should retry the acquisition rather than re-authenticate.
    #[error("session probe failed: {0}")]
    SessionProbeFailed(String),

    /// The websocket could not be re-established within the bounded number
    /// of reconnection attempts.
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    /// The platform signalled "too many requests" and the retry bound was
    /// exceeded. Rate limits below the bound are handled internally.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// A network-level failure that may succeed on retry.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// An operation exceeded its configured timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The platform violated the expected wire contract (malformed frame,
    /// missing markup token, undecodable response body).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The platform refused the action (permission denied, message too old
    /// to edit, ...). Never retried.
    #[error("action rejected ({status}): {message}")]
    ActionRejected { status: u16, message: String },

    /// Websocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The caller supplied an unusable configuration or argument.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The command was cancelled before completion because its room was left.
    #[error("cancelled: room is closed")]
    Cancelled,

    /// Filesystem failure while reading or writing the credential file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl BanterLinkError {
    /// `true` for failures that are worth retrying after a backoff wait.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SessionProbeFailed(_)
                | Self::RateLimited { .. }
                | Self::TransientNetwork(_)
                | Self::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for BanterLinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::TransientNetwork(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BanterLinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BanterLinkError::TransientNetwork("reset".into()).is_transient());
        assert!(BanterLinkError::Timeout("read".into()).is_transient());
        assert!(BanterLinkError::RateLimited {
            retry_after: Duration::from_secs(3)
        }
        .is_transient());
        assert!(!BanterLinkError::AuthenticationFailure("bad password".into()).is_transient());
        assert!(!BanterLinkError::ActionRejected {
            status: 403,
            message: "nope".into()
        }
        .is_transient());
        assert!(!BanterLinkError::Cancelled.is_transient());
    }

    #[test]
    fn test_json_errors_map_to_protocol() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let mapped = BanterLinkError::from(err);
        assert!(matches!(mapped, BanterLinkError::Protocol(_)));
    }
}
