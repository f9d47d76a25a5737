//! Pluggable payload serialization.
//!
//! The frame codec never interprets argument or result bytes. Method tables
//! and clients use a [`Serializer`] to turn typed values into the embedded
//! payload and back. [`CborSerializer`] is the default.

use serde::{Serialize, de::DeserializeOwned};

use crate::errors::{ProtocolError, Result};

/// Converts typed values to and from embedded frame payloads.
pub trait Serializer: Send + Sync + 'static {
    /// Append the serialized form of `value` to `dst`
    fn serialize<T: Serialize + ?Sized>(&self, value: &T, dst: &mut Vec<u8>) -> Result<()>;

    /// Read a value from a complete payload
    fn deserialize<T: DeserializeOwned>(&self, src: &[u8]) -> Result<T>;

    /// Serialize into a fresh buffer
    fn to_vec<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.serialize(value, &mut buf)?;
        Ok(buf)
    }
}

/// CBOR payloads via `ciborium`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl Serializer for CborSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T, dst: &mut Vec<u8>) -> Result<()> {
        ciborium::into_writer(value, dst).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, src: &[u8]) -> Result<T> {
        ciborium::from_reader(src).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}
