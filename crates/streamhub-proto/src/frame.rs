//! Frame envelope and codec.
//!
//! # Layouts
//!
//! ```text
//! toward the server                         toward the client
//! ─────────────────                         ────────────────
//! 2  [methodId, args]            FnF        2  [methodId, args]              Broadcast
//! 3  [messageId, methodId, args] Request    3  [messageId, methodId, result] Response
//! 4  [0x00, requestId, methodId, result]    4  [messageId, status, detail, message|nil]
//!        ClientInvokeResponse                    ResponseWithError
//! 4  [0x01, requestId, methodId,            5  [0x00, nil, requestId, methodId, args]
//!        [status, detail, message|nil]]          ClientInvokeRequest
//!        ClientInvokeResponseWithError      5  [0x7E, seq, sentAt, nil, nil]
//! 4  [0x7E, seq, sentAt, extra|nil]              ClientHeartbeatAck
//!        ClientHeartbeat                    5  [0x7F, seq, sentAt, nil, metadata|nil]
//! 4  [0x7F, seq, sentAt, nil]                    ServerHeartbeat
//!        ServerHeartbeatAck
//! ```
//!
//! `args`, `result`, `metadata` and `extra` are serializer output embedded as
//! the final array element. Encoding appends them verbatim; decoding slices
//! them out of the received [`Bytes`] without copying.

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    errors::{ProtocolError, Result},
    ids::{MessageId, MethodId, RequestId},
    msgpack::{self, NIL, Reader},
    status::{RemoteError, StatusCode},
};

/// Direction a frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server
    ToServer,
    /// Server to client
    ToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToServer => f.write_str("to server"),
            Self::ToClient => f.write_str("to client"),
        }
    }
}

/// Discriminator for client invoke results
const TAG_INVOKE_OK: u8 = 0x00;
/// Discriminator for client invoke failures
const TAG_INVOKE_ERR: u8 = 0x01;
/// Discriminator for client-initiated heartbeats and their acks
const TAG_CLIENT_HEARTBEAT: u8 = 0x7e;
/// Discriminator for server-initiated heartbeats and their acks
const TAG_SERVER_HEARTBEAT: u8 = 0x7f;

/// One decoded hub frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client call that expects no response
    RequestFireAndForget {
        /// Target method
        method_id: MethodId,
        /// Serialized arguments
        args: Bytes,
    },
    /// Client call awaiting a [`Frame::Response`] or [`Frame::ResponseWithError`]
    Request {
        /// Correlation id chosen by the client
        message_id: MessageId,
        /// Target method
        method_id: MethodId,
        /// Serialized arguments
        args: Bytes,
    },
    /// Successful result of a [`Frame::Request`]
    Response {
        /// Correlation id of the request
        message_id: MessageId,
        /// Method that produced the result
        method_id: MethodId,
        /// Serialized result
        result: Bytes,
    },
    /// Failed result of a [`Frame::Request`]
    ResponseWithError {
        /// Correlation id of the request
        message_id: MessageId,
        /// Failure
        error: RemoteError,
    },
    /// Server push to a client
    Broadcast {
        /// Receiver method on the client
        method_id: MethodId,
        /// Serialized arguments
        args: Bytes,
    },
    /// Server invoking a method implemented by the client
    ClientInvokeRequest {
        /// Correlation id chosen by the server
        request_id: RequestId,
        /// Receiver method on the client
        method_id: MethodId,
        /// Serialized arguments
        args: Bytes,
    },
    /// Successful result of a [`Frame::ClientInvokeRequest`]
    ClientInvokeResponse {
        /// Correlation id of the invocation
        request_id: RequestId,
        /// Method that produced the result
        method_id: MethodId,
        /// Serialized result
        result: Bytes,
    },
    /// Failed result of a [`Frame::ClientInvokeRequest`]
    ClientInvokeResponseWithError {
        /// Correlation id of the invocation
        request_id: RequestId,
        /// Method that failed
        method_id: MethodId,
        /// Failure
        error: RemoteError,
    },
    /// Liveness probe sent by the server
    ServerHeartbeat {
        /// Heartbeat sequence number
        sequence: u32,
        /// Server wall clock at send time, Unix milliseconds
        sent_at_ms: i64,
        /// Optional serialized metadata (empty when absent)
        metadata: Bytes,
    },
    /// Client acknowledgement of a [`Frame::ServerHeartbeat`]
    ServerHeartbeatAck {
        /// Sequence being acknowledged
        sequence: u32,
        /// Echo of the heartbeat's send time
        sent_at_ms: i64,
    },
    /// Liveness probe sent by the client
    ClientHeartbeat {
        /// Heartbeat sequence number
        sequence: u32,
        /// Client clock at send time, milliseconds
        sent_at_ms: i64,
        /// Optional serialized extra data (empty when absent)
        extra: Bytes,
    },
    /// Server acknowledgement of a [`Frame::ClientHeartbeat`]
    ClientHeartbeatAck {
        /// Sequence being acknowledged
        sequence: u32,
        /// Echo of the heartbeat's send time
        sent_at_ms: i64,
    },
}

/// Frame kind without its fields, for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum FrameKind {
    RequestFireAndForget,
    Request,
    Response,
    ResponseWithError,
    Broadcast,
    ClientInvokeRequest,
    ClientInvokeResponse,
    ClientInvokeResponseWithError,
    ServerHeartbeat,
    ServerHeartbeatAck,
    ClientHeartbeat,
    ClientHeartbeatAck,
}

impl Frame {
    /// Kind of this frame
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::RequestFireAndForget { .. } => FrameKind::RequestFireAndForget,
            Self::Request { .. } => FrameKind::Request,
            Self::Response { .. } => FrameKind::Response,
            Self::ResponseWithError { .. } => FrameKind::ResponseWithError,
            Self::Broadcast { .. } => FrameKind::Broadcast,
            Self::ClientInvokeRequest { .. } => FrameKind::ClientInvokeRequest,
            Self::ClientInvokeResponse { .. } => FrameKind::ClientInvokeResponse,
            Self::ClientInvokeResponseWithError { .. } => FrameKind::ClientInvokeResponseWithError,
            Self::ServerHeartbeat { .. } => FrameKind::ServerHeartbeat,
            Self::ServerHeartbeatAck { .. } => FrameKind::ServerHeartbeatAck,
            Self::ClientHeartbeat { .. } => FrameKind::ClientHeartbeat,
            Self::ClientHeartbeatAck { .. } => FrameKind::ClientHeartbeatAck,
        }
    }

    /// Direction this frame travels
    pub fn direction(&self) -> Direction {
        match self {
            Self::RequestFireAndForget { .. }
            | Self::Request { .. }
            | Self::ClientInvokeResponse { .. }
            | Self::ClientInvokeResponseWithError { .. }
            | Self::ServerHeartbeatAck { .. }
            | Self::ClientHeartbeat { .. } => Direction::ToServer,
            Self::Response { .. }
            | Self::ResponseWithError { .. }
            | Self::Broadcast { .. }
            | Self::ClientInvokeRequest { .. }
            | Self::ServerHeartbeat { .. }
            | Self::ClientHeartbeatAck { .. } => Direction::ToClient,
        }
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::RequestFireAndForget { method_id, args } | Self::Broadcast { method_id, args } => {
                msgpack::write_array_len(dst, 2)?;
                msgpack::write_int(dst, i64::from(method_id.get()), "method id")?;
                dst.extend_from_slice(args);
            },
            Self::Request { message_id, method_id, args } => {
                msgpack::write_array_len(dst, 3)?;
                msgpack::write_int(dst, i64::from(*message_id), "message id")?;
                msgpack::write_int(dst, i64::from(method_id.get()), "method id")?;
                dst.extend_from_slice(args);
            },
            Self::Response { message_id, method_id, result } => {
                msgpack::write_array_len(dst, 3)?;
                msgpack::write_int(dst, i64::from(*message_id), "message id")?;
                msgpack::write_int(dst, i64::from(method_id.get()), "method id")?;
                dst.extend_from_slice(result);
            },
            Self::ResponseWithError { message_id, error } => {
                msgpack::write_array_len(dst, 4)?;
                msgpack::write_int(dst, i64::from(*message_id), "message id")?;
                msgpack::write_int(dst, i64::from(error.status.code()), "status code")?;
                msgpack::write_str(dst, &error.detail, "detail")?;
                msgpack::write_opt_str(dst, error.message.as_deref(), "message")?;
            },
            Self::ClientInvokeRequest { request_id, method_id, args } => {
                msgpack::write_array_len(dst, 5)?;
                msgpack::write_uint(dst, u64::from(TAG_INVOKE_OK), "discriminator")?;
                msgpack::write_nil(dst);
                write_request_id(dst, *request_id)?;
                msgpack::write_int(dst, i64::from(method_id.get()), "method id")?;
                dst.extend_from_slice(args);
            },
            Self::ClientInvokeResponse { request_id, method_id, result } => {
                msgpack::write_array_len(dst, 4)?;
                msgpack::write_uint(dst, u64::from(TAG_INVOKE_OK), "discriminator")?;
                write_request_id(dst, *request_id)?;
                msgpack::write_int(dst, i64::from(method_id.get()), "method id")?;
                dst.extend_from_slice(result);
            },
            Self::ClientInvokeResponseWithError { request_id, method_id, error } => {
                msgpack::write_array_len(dst, 4)?;
                msgpack::write_uint(dst, u64::from(TAG_INVOKE_ERR), "discriminator")?;
                write_request_id(dst, *request_id)?;
                msgpack::write_int(dst, i64::from(method_id.get()), "method id")?;
                msgpack::write_array_len(dst, 3)?;
                msgpack::write_int(dst, i64::from(error.status.code()), "status code")?;
                msgpack::write_str(dst, &error.detail, "detail")?;
                msgpack::write_opt_str(dst, error.message.as_deref(), "message")?;
            },
            Self::ServerHeartbeat { sequence, sent_at_ms, metadata } => {
                msgpack::write_array_len(dst, 5)?;
                msgpack::write_uint(dst, u64::from(TAG_SERVER_HEARTBEAT), "discriminator")?;
                msgpack::write_uint(dst, u64::from(*sequence), "sequence")?;
                msgpack::write_int(dst, *sent_at_ms, "sent at")?;
                msgpack::write_nil(dst);
                msgpack::write_raw_or_nil(dst, metadata);
            },
            Self::ServerHeartbeatAck { sequence, sent_at_ms } => {
                msgpack::write_array_len(dst, 4)?;
                msgpack::write_uint(dst, u64::from(TAG_SERVER_HEARTBEAT), "discriminator")?;
                msgpack::write_uint(dst, u64::from(*sequence), "sequence")?;
                msgpack::write_int(dst, *sent_at_ms, "sent at")?;
                msgpack::write_nil(dst);
            },
            Self::ClientHeartbeat { sequence, sent_at_ms, extra } => {
                msgpack::write_array_len(dst, 4)?;
                msgpack::write_uint(dst, u64::from(TAG_CLIENT_HEARTBEAT), "discriminator")?;
                msgpack::write_uint(dst, u64::from(*sequence), "sequence")?;
                msgpack::write_int(dst, *sent_at_ms, "sent at")?;
                msgpack::write_raw_or_nil(dst, extra);
            },
            Self::ClientHeartbeatAck { sequence, sent_at_ms } => {
                msgpack::write_array_len(dst, 5)?;
                msgpack::write_uint(dst, u64::from(TAG_CLIENT_HEARTBEAT), "discriminator")?;
                msgpack::write_uint(dst, u64::from(*sequence), "sequence")?;
                msgpack::write_int(dst, *sent_at_ms, "sent at")?;
                msgpack::write_nil(dst);
                msgpack::write_nil(dst);
            },
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.encoded_len_hint());
        self.encode(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn encoded_len_hint(&self) -> usize {
        // header fields fit in 48 bytes for every kind
        48 + match self {
            Self::RequestFireAndForget { args, .. }
            | Self::Request { args, .. }
            | Self::Broadcast { args, .. }
            | Self::ClientInvokeRequest { args, .. } => args.len(),
            Self::Response { result, .. } | Self::ClientInvokeResponse { result, .. } => {
                result.len()
            },
            Self::ResponseWithError { error, .. }
            | Self::ClientInvokeResponseWithError { error, .. } => {
                error.detail.len() + error.message.as_ref().map_or(0, String::len)
            },
            Self::ServerHeartbeat { metadata, .. } => metadata.len(),
            Self::ClientHeartbeat { extra, .. } => extra.len(),
            Self::ServerHeartbeatAck { .. } | Self::ClientHeartbeatAck { .. } => 0,
        }
    }

    /// Decode one frame travelling in `direction`.
    ///
    /// Payload fields are zero-copy slices of `src`.
    pub fn decode(src: &Bytes, direction: Direction) -> Result<Self> {
        let mut reader = Reader::new(src);
        let count = reader.array_len()?;

        let frame = match (direction, count) {
            (Direction::ToServer, 2) => {
                let method_id = MethodId::new(reader.i32("method id")?);
                Self::RequestFireAndForget { method_id, args: tail(src, &reader) }
            },
            (Direction::ToServer, 3) => {
                let message_id = reader.i32("message id")?;
                let method_id = MethodId::new(reader.i32("method id")?);
                Self::Request { message_id, method_id, args: tail(src, &reader) }
            },
            (Direction::ToServer, 4) => match peek_tag(&reader, count)? {
                TAG_INVOKE_OK => {
                    reader.u8("discriminator")?;
                    let request_id = read_request_id(&mut reader)?;
                    let method_id = MethodId::new(reader.i32("method id")?);
                    Self::ClientInvokeResponse { request_id, method_id, result: tail(src, &reader) }
                },
                TAG_INVOKE_ERR => {
                    reader.u8("discriminator")?;
                    let request_id = read_request_id(&mut reader)?;
                    let method_id = MethodId::new(reader.i32("method id")?);
                    let inner = reader.array_len()?;
                    if inner != 3 {
                        return Err(ProtocolError::invalid(
                            "error envelope",
                            format!("expected 3 elements, got {inner}"),
                        ));
                    }
                    let error = read_remote_error(&mut reader)?;
                    finish(&reader)?;
                    Self::ClientInvokeResponseWithError { request_id, method_id, error }
                },
                TAG_CLIENT_HEARTBEAT => {
                    reader.u8("discriminator")?;
                    let sequence = reader.u32("sequence")?;
                    let sent_at_ms = reader.i64("sent at")?;
                    Self::ClientHeartbeat { sequence, sent_at_ms, extra: optional_tail(src, &reader, "extra")? }
                },
                TAG_SERVER_HEARTBEAT => {
                    reader.u8("discriminator")?;
                    let sequence = reader.u32("sequence")?;
                    let sent_at_ms = reader.i64_or_nil("sent at")?;
                    reader.nil("reserved")?;
                    finish(&reader)?;
                    Self::ServerHeartbeatAck { sequence, sent_at_ms }
                },
                tag => return Err(ProtocolError::UnknownDiscriminator { count, tag }),
            },
            (Direction::ToClient, 2) => {
                let method_id = MethodId::new(reader.i32("method id")?);
                Self::Broadcast { method_id, args: tail(src, &reader) }
            },
            (Direction::ToClient, 3) => {
                let message_id = reader.i32("message id")?;
                let method_id = MethodId::new(reader.i32("method id")?);
                Self::Response { message_id, method_id, result: tail(src, &reader) }
            },
            (Direction::ToClient, 4) => {
                let message_id = reader.i32("message id")?;
                let error = read_remote_error(&mut reader)?;
                finish(&reader)?;
                Self::ResponseWithError { message_id, error }
            },
            (Direction::ToClient, 5) => match peek_tag(&reader, count)? {
                TAG_INVOKE_OK => {
                    reader.u8("discriminator")?;
                    reader.nil("reserved")?;
                    let request_id = read_request_id(&mut reader)?;
                    let method_id = MethodId::new(reader.i32("method id")?);
                    Self::ClientInvokeRequest { request_id, method_id, args: tail(src, &reader) }
                },
                TAG_CLIENT_HEARTBEAT => {
                    reader.u8("discriminator")?;
                    let sequence = reader.u32("sequence")?;
                    let sent_at_ms = reader.i64_or_nil("sent at")?;
                    reader.nil("reserved")?;
                    reader.nil("reserved")?;
                    finish(&reader)?;
                    Self::ClientHeartbeatAck { sequence, sent_at_ms }
                },
                TAG_SERVER_HEARTBEAT => {
                    reader.u8("discriminator")?;
                    let sequence = reader.u32("sequence")?;
                    let sent_at_ms = reader.i64("sent at")?;
                    reader.nil("reserved")?;
                    Self::ServerHeartbeat { sequence, sent_at_ms, metadata: optional_tail(src, &reader, "metadata")? }
                },
                tag => return Err(ProtocolError::UnknownDiscriminator { count, tag }),
            },
            (direction, count) => return Err(ProtocolError::InvalidElementCount { count, direction }),
        };

        Ok(frame)
    }
}

fn peek_tag(reader: &Reader<'_>, count: u32) -> Result<u8> {
    let tag = reader.peek().ok_or(ProtocolError::Truncated { field: "discriminator" })?;
    // Discriminators are positive fixints, so the marker byte is the value
    if tag > 0x7f {
        return Err(ProtocolError::UnknownDiscriminator { count, tag });
    }
    Ok(tag)
}

/// Remaining bytes as the embedded payload.
///
/// Zero-length args are written as nothing at all, so a frame that ends
/// right after its header decodes with empty args. Truncation inside the
/// header is still an error.
fn tail(src: &Bytes, reader: &Reader<'_>) -> Bytes {
    src.slice(src.len() - reader.remaining()..)
}

/// Embedded payload where nil means absent.
///
/// The encoder always writes this element, nil when empty, so a missing one
/// means the frame was cut short.
fn optional_tail(src: &Bytes, reader: &Reader<'_>, field: &'static str) -> Result<Bytes> {
    let rest = tail(src, reader);
    match rest.as_ref() {
        [] => Err(ProtocolError::Truncated { field }),
        [NIL] => Ok(Bytes::new()),
        _ => Ok(rest),
    }
}

fn finish(reader: &Reader<'_>) -> Result<()> {
    match reader.remaining() {
        0 => Ok(()),
        n => Err(ProtocolError::invalid("frame", format!("{n} trailing bytes"))),
    }
}

fn write_request_id(dst: &mut Vec<u8>, id: RequestId) -> Result<()> {
    let mut text = Uuid::encode_buffer();
    msgpack::write_str(dst, id.as_uuid().hyphenated().encode_lower(&mut text), "request id")
}

fn read_request_id(reader: &mut Reader<'_>) -> Result<RequestId> {
    let text = reader.str("request id")?;
    Uuid::parse_str(text)
        .map(RequestId::from_uuid)
        .map_err(|e| ProtocolError::invalid("request id", e.to_string()))
}

fn read_remote_error(reader: &mut Reader<'_>) -> Result<RemoteError> {
    let status = StatusCode::new(reader.i32("status code")?);
    let detail = reader.str("detail")?.to_owned();
    let message = reader.opt_str("message")?.map(str::to_owned);
    Ok(RemoteError { status, detail, message })
}
