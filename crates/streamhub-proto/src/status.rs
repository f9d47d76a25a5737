//! Status codes and structured remote failures.
//!
//! Status codes follow the gRPC numbering so error responses stay meaningful
//! to tooling that already knows those codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status code carried by error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusCode(i32);

impl StatusCode {
    /// Success
    pub const OK: Self = Self(0);
    /// Operation was cancelled
    pub const CANCELLED: Self = Self(1);
    /// Unknown error
    pub const UNKNOWN: Self = Self(2);
    /// Caller supplied invalid arguments
    pub const INVALID_ARGUMENT: Self = Self(3);
    /// Deadline expired before the operation completed
    pub const DEADLINE_EXCEEDED: Self = Self(4);
    /// Requested entity was not found
    pub const NOT_FOUND: Self = Self(5);
    /// Caller lacks permission
    pub const PERMISSION_DENIED: Self = Self(7);
    /// Operation rejected because the system is not in the required state
    pub const FAILED_PRECONDITION: Self = Self(9);
    /// Method is not implemented by the peer
    pub const UNIMPLEMENTED: Self = Self(12);
    /// Internal error in the peer
    pub const INTERNAL: Self = Self(13);
    /// Peer is currently unavailable
    pub const UNAVAILABLE: Self = Self(14);

    /// Wrap a raw status code
    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    /// Raw status code
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Canonical name, if the code is one of the well-known values
    pub const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "OK",
            1 => "CANCELLED",
            2 => "UNKNOWN",
            3 => "INVALID_ARGUMENT",
            4 => "DEADLINE_EXCEEDED",
            5 => "NOT_FOUND",
            7 => "PERMISSION_DENIED",
            9 => "FAILED_PRECONDITION",
            12 => "UNIMPLEMENTED",
            13 => "INTERNAL",
            14 => "UNAVAILABLE",
            _ => return None,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "status {}", self.0),
        }
    }
}

/// A failure reported by the remote peer for one call.
///
/// `message` carries diagnostic text (for example a handler's error chain) and
/// is only populated when the peer is configured to expose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Status code
    pub status: StatusCode,
    /// Human-readable summary
    pub detail: String,
    /// Optional diagnostic message
    pub message: Option<String>,
}

impl RemoteError {
    /// Build a remote error without a diagnostic message
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into(), message: None }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.detail)?;
        if let Some(message) = &self.message {
            write!(f, " ({message})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
