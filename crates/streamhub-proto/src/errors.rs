//! Protocol error types

use thiserror::Error;

use crate::frame::Direction;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding frames.
///
/// Any of these on a live connection means the peer speaks a different
/// protocol (or is hostile); the connection is torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message is not a MessagePack array
    #[error("frame is not an array")]
    NotAnArray,

    /// The array has an element count no frame kind uses in this direction
    #[error("invalid element count {count} for a frame sent {direction}")]
    InvalidElementCount {
        /// Element count read from the array header
        count: u32,
        /// Direction the frame was decoded for
        direction: Direction,
    },

    /// The discriminator byte does not name a known frame kind
    #[error("unknown discriminator {tag:#04x} in a {count}-element frame")]
    UnknownDiscriminator {
        /// Element count of the enclosing frame
        count: u32,
        /// Raw discriminator byte
        tag: u8,
    },

    /// The buffer ended before the named field was complete
    #[error("frame truncated while reading {field}")]
    Truncated {
        /// Field being read
        field: &'static str,
    },

    /// A field is present but has the wrong type or an invalid value
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Field being read
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// Writing the frame into the output buffer failed
    #[error("failed to encode {field}")]
    Encode {
        /// Field being written
        field: &'static str,
    },

    /// The payload serializer rejected a value
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl ProtocolError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField { field, reason: reason.into() }
    }
}
