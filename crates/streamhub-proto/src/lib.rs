//! Wire format for StreamHub hub connections.
//!
//! Every transport message carries exactly one [`Frame`]. A frame is a
//! MessagePack array whose element count (and, where the count is shared by
//! two kinds, one leading discriminator byte) identifies the frame kind. The
//! last element of request, response, broadcast and heartbeat frames is an
//! opaque payload produced by a pluggable [`Serializer`]; the codec only ever
//! slices it out of the received buffer and never looks inside.
//!
//! Decoding needs to know which way the frame travels, because the same
//! element count means different things in each direction (a 4-element frame
//! toward the client is an error response, toward the server it is a client
//! invoke response or a heartbeat). See [`Direction`].
//!
//! # Security
//!
//! Decoding never trusts lengths from the wire beyond the received buffer:
//! every string and header read is bounds checked and malformed input becomes
//! a [`ProtocolError`], never a panic.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod frame;
pub mod ids;
mod msgpack;
pub mod serializer;
pub mod status;

pub use errors::{ProtocolError, Result};
pub use frame::{Direction, Frame, FrameKind};
pub use ids::{ConnectionId, MessageId, MethodId, RequestId};
pub use serializer::{CborSerializer, Serializer};
pub use status::{RemoteError, StatusCode};
