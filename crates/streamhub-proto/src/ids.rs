//! Identifiers carried on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-chosen correlation id for a request/response pair.
///
/// Unique among the caller's outstanding calls on one connection.
pub type MessageId = i32;

/// Stable 32-bit method identifier.
///
/// Ids are normally derived from the method name with [`MethodId::from_name`]
/// so both peers agree without exchanging a table; an explicit id can be
/// assigned with [`MethodId::new`] when a method is renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(i32);

impl MethodId {
    const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
    const FNV_PRIME: u32 = 16_777_619;

    /// Use an explicit id.
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    /// Derive the id from a method name (FNV-1a, 32 bit, over the UTF-8 bytes).
    pub const fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash = Self::FNV_OFFSET_BASIS;
        let mut i = 0;
        while i < bytes.len() {
            hash = (hash ^ bytes[i] as u32).wrapping_mul(Self::FNV_PRIME);
            i += 1;
        }
        Self(hash as i32)
    }

    /// Raw id as written on the wire
    pub const fn get(self) -> i32 {
        self.0
    }
}

impl From<i32> for MethodId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical identity of a client connection.
///
/// Survives transport reconnects: a reconnecting client presents the same id
/// so the server can treat the new transport as the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Size of the identity on the wire
    pub const SIZE: usize = 16;

    /// Build an identity from 16 random bytes (UUID v4 layout).
    pub fn from_random_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    /// Wrap an existing UUID
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Build from the raw 16-byte representation
    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw 16-byte representation
    pub const fn as_bytes(&self) -> &[u8; Self::SIZE] {
        self.0.as_bytes()
    }

    /// Underlying UUID
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Correlation id for a server-to-client invocation.
///
/// 128 bits so the server can mint ids without coordination across
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Build a request id from 16 random bytes.
    pub fn from_random_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    /// Wrap an existing UUID
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
