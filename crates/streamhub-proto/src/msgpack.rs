//! MessagePack field primitives used by the frame codec.
//!
//! Thin wrappers over `rmp` that attach the field name to every failure, so a
//! malformed frame reports which positional element was wrong.

use rmp::{decode, encode};

use crate::errors::{ProtocolError, Result};

pub(crate) const NIL: u8 = 0xc0;

pub(crate) fn write_array_len(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    encode::write_array_len(buf, len).map(drop).map_err(|_| ProtocolError::Encode { field: "array" })
}

pub(crate) fn write_int(buf: &mut Vec<u8>, value: i64, field: &'static str) -> Result<()> {
    encode::write_sint(buf, value).map(drop).map_err(|_| ProtocolError::Encode { field })
}

pub(crate) fn write_uint(buf: &mut Vec<u8>, value: u64, field: &'static str) -> Result<()> {
    encode::write_uint(buf, value).map(drop).map_err(|_| ProtocolError::Encode { field })
}

pub(crate) fn write_nil(buf: &mut Vec<u8>) {
    buf.push(NIL);
}

pub(crate) fn write_str(buf: &mut Vec<u8>, value: &str, field: &'static str) -> Result<()> {
    encode::write_str(buf, value).map_err(|_| ProtocolError::Encode { field })
}

pub(crate) fn write_opt_str(buf: &mut Vec<u8>, value: Option<&str>, field: &'static str) -> Result<()> {
    match value {
        Some(value) => write_str(buf, value, field),
        None => {
            write_nil(buf);
            Ok(())
        },
    }
}

/// Embedded payload: written verbatim, or nil when empty.
pub(crate) fn write_raw_or_nil(buf: &mut Vec<u8>, raw: &[u8]) {
    if raw.is_empty() {
        write_nil(buf);
    } else {
        buf.extend_from_slice(raw);
    }
}

/// Cursor over a received frame.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    fn ensure(&self, field: &'static str) -> Result<()> {
        if self.buf.is_empty() { Err(ProtocolError::Truncated { field }) } else { Ok(()) }
    }

    pub(crate) fn array_len(&mut self) -> Result<u32> {
        self.ensure("array header")?;
        decode::read_array_len(&mut self.buf).map_err(|_| ProtocolError::NotAnArray)
    }

    pub(crate) fn i32(&mut self, field: &'static str) -> Result<i32> {
        self.ensure(field)?;
        decode::read_int(&mut self.buf)
            .map_err(|_| ProtocolError::invalid(field, "expected a 32-bit integer"))
    }

    pub(crate) fn i64(&mut self, field: &'static str) -> Result<i64> {
        self.ensure(field)?;
        decode::read_int(&mut self.buf)
            .map_err(|_| ProtocolError::invalid(field, "expected a 64-bit integer"))
    }

    pub(crate) fn u32(&mut self, field: &'static str) -> Result<u32> {
        self.ensure(field)?;
        decode::read_int(&mut self.buf)
            .map_err(|_| ProtocolError::invalid(field, "expected an unsigned integer"))
    }

    pub(crate) fn u8(&mut self, field: &'static str) -> Result<u8> {
        self.ensure(field)?;
        decode::read_int(&mut self.buf)
            .map_err(|_| ProtocolError::invalid(field, "expected a discriminator"))
    }

    /// Integer, or nil read as zero.
    pub(crate) fn i64_or_nil(&mut self, field: &'static str) -> Result<i64> {
        if self.peek() == Some(NIL) {
            self.nil(field)?;
            Ok(0)
        } else {
            self.i64(field)
        }
    }

    pub(crate) fn nil(&mut self, field: &'static str) -> Result<()> {
        self.ensure(field)?;
        decode::read_nil(&mut self.buf).map_err(|_| ProtocolError::invalid(field, "expected nil"))
    }

    pub(crate) fn str(&mut self, field: &'static str) -> Result<&'a str> {
        self.ensure(field)?;
        let len = decode::read_str_len(&mut self.buf)
            .map_err(|_| ProtocolError::invalid(field, "expected a string"))? as usize;
        if self.buf.len() < len {
            return Err(ProtocolError::Truncated { field });
        }
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::invalid(field, "invalid UTF-8"))
    }

    pub(crate) fn opt_str(&mut self, field: &'static str) -> Result<Option<&'a str>> {
        if self.peek() == Some(NIL) {
            self.nil(field)?;
            Ok(None)
        } else {
            self.str(field).map(Some)
        }
    }
}
