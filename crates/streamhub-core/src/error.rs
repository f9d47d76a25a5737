//! Error types
//!
//! Failures are scoped: [`MethodError`] and [`CallError`] belong to one call,
//! [`HubError`] and [`DisconnectReason`] to one connection. Nothing here is
//! process-wide.

use std::{io, time::Duration};

use streamhub_proto::{ConnectionId, MethodId, ProtocolError, RemoteError, StatusCode};
use thiserror::Error;

/// Connection-level failure raised while serving frames.
#[derive(Debug, Error)]
pub enum HubError {
    /// Peer sent a malformed frame
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Frame referenced a method the table does not contain
    #[error("unknown method {method_id}")]
    UnknownMethod {
        /// Requested method
        method_id: MethodId,
    },

    /// A handler failed
    #[error("handler for method {method_id} failed: {source}")]
    HandlerFault {
        /// Method whose handler failed
        method_id: MethodId,
        /// Handler error
        #[source]
        source: MethodError,
    },

    /// Heartbeat watchdog expired
    #[error("heartbeat timed out")]
    Timeout,

    /// Transport read or write failed
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl HubError {
    /// Whether the fault ends its connection.
    ///
    /// `UnknownMethod` and `HandlerFault` fail only the call that caused
    /// them; the connection keeps serving.
    pub fn ends_connection(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout | Self::Transport(_))
    }

    /// Reason reported to disconnect observers, for faults that end the
    /// connection
    pub fn reason(&self) -> Option<DisconnectReason> {
        match self {
            Self::Protocol(e) => Some(DisconnectReason::Protocol(e.clone())),
            Self::Timeout => Some(DisconnectReason::HeartbeatTimeout),
            Self::Transport(e) => Some(DisconnectReason::Transport(e.to_string())),
            Self::UnknownMethod { .. } | Self::HandlerFault { .. } => None,
        }
    }

    /// Error reported to the caller whose call hit this fault
    pub fn to_method_error(&self) -> MethodError {
        match self {
            Self::UnknownMethod { method_id } => MethodError::unimplemented(*method_id),
            Self::HandlerFault { source, .. } => source.clone(),
            Self::Protocol(e) => MethodError::internal(e.to_string()),
            Self::Timeout | Self::Transport(_) => MethodError::new(StatusCode::UNAVAILABLE, self.to_string()),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the transport cleanly
    Closed,
    /// Local side closed the connection
    LocalClose,
    /// Heartbeat watchdog expired
    HeartbeatTimeout,
    /// Peer sent a malformed frame
    Protocol(ProtocolError),
    /// Transport failed
    Transport(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed by peer"),
            Self::LocalClose => f.write_str("closed locally"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Self::Protocol(e) => write!(f, "protocol violation: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Failure returned by a method handler.
///
/// Becomes a `ResponseWithError` (or `ClientInvokeResponseWithError`) frame.
/// `message` is diagnostic text that is only sent when the server is
/// configured to expose it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{status}: {detail}")]
pub struct MethodError {
    /// Status code
    pub status: StatusCode,
    /// Summary sent to the caller
    pub detail: String,
    /// Diagnostic message
    pub message: Option<String>,
}

impl MethodError {
    /// Build an error with a status and summary
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into(), message: None }
    }

    /// Arguments could not be decoded or were rejected
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INVALID_ARGUMENT, detail)
    }

    /// Unexpected failure inside the handler
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL, detail)
    }

    /// No handler is registered for the method
    pub fn unimplemented(method_id: MethodId) -> Self {
        Self::new(StatusCode::UNIMPLEMENTED, format!("method {method_id} is not implemented"))
    }

    /// Attach a diagnostic message
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Wire representation; the diagnostic message is dropped unless exposed
    pub fn into_remote(self, expose_message: bool) -> RemoteError {
        RemoteError {
            status: self.status,
            detail: self.detail,
            message: if expose_message { self.message } else { None },
        }
    }
}

/// Call-site failure of an outgoing call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Peer answered with an error
    #[error("remote call failed: {0}")]
    Remote(RemoteError),

    /// Call was cancelled before a response arrived (including teardown)
    #[error("call cancelled")]
    Cancelled,

    /// No live connection to send the call on
    #[error("not connected")]
    Disconnected,

    /// No response within the call deadline
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),

    /// Arguments or result could not be encoded or decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CallError {
    /// Status code equivalent, for surfacing the failure as a remote error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Remote(error) => error.status,
            Self::Cancelled => StatusCode::CANCELLED,
            Self::Disconnected => StatusCode::UNAVAILABLE,
            Self::TimedOut(_) => StatusCode::DEADLINE_EXCEEDED,
            Self::Protocol(_) => StatusCode::INTERNAL,
        }
    }
}

impl From<CallError> for MethodError {
    fn from(error: CallError) -> Self {
        match error {
            CallError::Remote(remote) => {
                Self { status: remote.status, detail: remote.detail, message: remote.message }
            },
            other => Self::new(other.status(), other.to_string()),
        }
    }
}

impl From<RemoteError> for CallError {
    fn from(error: RemoteError) -> Self {
        Self::Remote(error)
    }
}

/// Payload pool misuse.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Handle refers to a slot that was already returned (or reused)
    #[error("stale payload handle (slot {index}, generation {generation})")]
    StaleHandle {
        /// Slot index
        index: u32,
        /// Generation carried by the handle
        generation: u32,
    },
}

/// Non-blocking delivery to a connection failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Connection is closed
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// Connection's send queue is full
    #[error("send queue of connection {0} is full")]
    Full(ConnectionId),
}

/// Method table construction failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    /// Two methods map to the same id
    #[error("method id {method_id} is used by both {existing} and {name}")]
    DuplicateMethod {
        /// Colliding id
        method_id: MethodId,
        /// Method registered first
        existing: String,
        /// Method registered second
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_faults_keep_the_connection() {
        let unknown = HubError::UnknownMethod { method_id: MethodId::new(9) };
        assert!(!unknown.ends_connection());
        assert_eq!(unknown.reason(), None);
        assert_eq!(unknown.to_method_error().status, StatusCode::UNIMPLEMENTED);

        let source = MethodError::new(StatusCode::PERMISSION_DENIED, "no").with_message("why");
        let fault = HubError::HandlerFault { method_id: MethodId::new(9), source: source.clone() };
        assert!(!fault.ends_connection());
        assert_eq!(fault.reason(), None);
        assert_eq!(fault.to_method_error(), source);
    }

    #[test]
    fn connection_faults_map_to_disconnect_reasons() {
        assert_eq!(HubError::Timeout.reason(), Some(DisconnectReason::HeartbeatTimeout));

        let transport = HubError::Transport(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(transport.ends_connection());
        assert!(matches!(transport.reason(), Some(DisconnectReason::Transport(_))));
        assert_eq!(transport.to_method_error().status, StatusCode::UNAVAILABLE);
    }
}
