//! RESP (REdis Serialization Protocol) value model, decoder and encoder.
//!
//! The decoder lives in [`crate::wire::WireIo`] and is deliberately
//! streaming: it never materializes a bulk payload larger than the caller
//! asked for, which is what lets the RDB snapshot (a single giant bulk
//! string) flow through the same buffer as ordinary commands.

pub mod encode;

use bytes::Bytes;

/// One decoded RESP value. The two wire encodings of "nil" (`$-1\r\n` and
/// `*-1\r\n`) are kept as distinct variants ([`RespValue::NullBulkString`] /
/// [`RespValue::NullArray`]) rather than collapsed into one, so the encoder
/// can re-derive which wire form to use from context (bulk position vs
/// array position) instead of needing to be told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    NullBulkString,
    Array(Vec<RespValue>),
    NullArray,
}

impl RespValue {
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn into_bulk_string(self) -> Option<Bytes> {
        match self {
            RespValue::BulkString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_simple_string(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(bytes) => Some(bytes),
            _ => None,
        }
    }
}
