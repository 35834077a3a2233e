//! Error taxonomy shared by the session, dispatch and service layers.

use std::time::Duration;

use thiserror::Error;

use crate::AgentId;

/// Failure of a single dispatched request.
///
/// The dispatch layer never retries on its own; callers inspect
/// [`DispatchError::is_retryable`] and decide.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No session for the agent (locally, or anywhere in the cluster).
    #[error("agent {0} is not connected")]
    NotConnected(AgentId),
    /// The session terminated while the request was outstanding.
    #[error("connection to agent lost: {0}")]
    ConnectionError(String),
    /// Deadline elapsed without a response; the session stays open.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The session cannot take more requests right now.
    #[error("too many requests in flight")]
    Backpressure,
    /// The agent answered with an error status.
    #[error("agent rejected request: {0}")]
    Rejected(String),
    /// A peer replica could not be reached or answered garbage.
    #[error("forwarding failed: {0}")]
    Forwarding(String),
    /// A forwarded request would have been forwarded again.
    #[error("forwarding loop detected")]
    ForwardingLoop,
}

impl DispatchError {
    /// Whether re-issuing the request later might succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected(_) | Self::ConnectionError(_))
    }

    /// Stable code used on the forwarding wire and in metrics.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotConnected(_) => "not_connected",
            Self::ConnectionError(_) => "connection_error",
            Self::Timeout(_) => "timeout",
            Self::Backpressure => "backpressure",
            Self::Rejected(_) => "rejected",
            Self::Forwarding(_) => "forwarding",
            Self::ForwardingLoop => "forwarding_loop",
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("agent disconnected")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed or unexpected message; stream framing is not recoverable.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no traffic for {0:?}")]
    KeepaliveTimeout(Duration),
    #[error("replaced by a newer session")]
    Evicted,
    #[error("kicked")]
    Kicked,
    #[error("drained")]
    Drained,
}

impl CloseReason {
    /// Label value for the disconnects counter.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::KeepaliveTimeout(_) => "keepalive",
            Self::Evicted => "evicted",
            Self::Kicked => "kick",
            Self::Drained => "drained",
        }
    }
}

/// Transport-level failure reported by a stream adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),
    /// Frame could not be decoded into a message.
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("stream closed")]
    Closed,
}

impl From<TransportError> for CloseReason {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Malformed(msg) => Self::Protocol(msg),
            TransportError::Closed => Self::Disconnected,
            TransportError::Io(msg) => Self::Transport(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_errors_are_retryable() {
        assert!(DispatchError::NotConnected(AgentId::new("a")).is_retryable());
        assert!(DispatchError::ConnectionError("eof".into()).is_retryable());
        assert!(!DispatchError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!DispatchError::Rejected("nope".into()).is_retryable());
    }

    #[test]
    fn test_malformed_frame_closes_with_protocol_error() {
        let reason = CloseReason::from(TransportError::Malformed("bad json".into()));
        assert_eq!(reason.label(), "protocol");
    }
}
