// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed binary layout shared by every wire message.
//!
//! Each message starts with an 8 byte header (little-endian):
//! - 2 bytes: block length (size of the fixed-field block)
//! - 2 bytes: template id (message kind)
//! - 2 bytes: schema id
//! - 2 bytes: schema version
//!
//! The fixed block follows, then the variable-length fields in declaration
//! order, each prefixed with its own length. A decoder that knows the header
//! can therefore compute the full byte length of a message without any
//! outer framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Message header size in bytes.
pub const HEADER_LENGTH: usize = 8;

/// Schema id carried by every message of this protocol.
pub const SCHEMA_ID: u16 = 1;

/// Current schema version.
pub const SCHEMA_VERSION: u16 = 1;

/// Null value for partition id fields.
pub const NULL_PARTITION_ID: u16 = u16::MAX;

/// Null value for key fields.
pub const NULL_KEY: i64 = -1;

/// Null value for log position fields.
pub const NULL_POSITION: u64 = u64::MAX;

/// Longest string a `u16` length prefix can describe.
pub const MAX_STRING_LENGTH: usize = u16::MAX as usize;

/// Errors raised while encoding a wire message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("field '{field}' is {length} bytes long (max: {MAX_STRING_LENGTH})")]
    FieldTooLong { field: &'static str, length: usize },
}

/// Errors raised while decoding a wire message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unexpected template id {actual} (expected {expected})")]
    UnexpectedTemplate { expected: u16, actual: u16 },

    #[error("unknown template id {0}")]
    UnknownTemplate(u16),

    #[error("unsupported schema id {0}")]
    UnsupportedSchema(u16),

    #[error("block length {actual} is shorter than the minimum {minimum}")]
    BlockTooShort { minimum: u16, actual: u16 },

    #[error("field '{0}' is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("invalid value {value} for field '{field}'")]
    InvalidValue { field: &'static str, value: u64 },
}

/// Header preceding every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl MessageHeader {
    pub fn new(template_id: u16, block_length: u16) -> Self {
        Self {
            block_length,
            template_id,
            schema_id: SCHEMA_ID,
            version: SCHEMA_VERSION,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.block_length);
        buf.put_u16_le(self.template_id);
        buf.put_u16_le(self.schema_id);
        buf.put_u16_le(self.version);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(&*buf, HEADER_LENGTH)?;
        let header = Self {
            block_length: buf.get_u16_le(),
            template_id: buf.get_u16_le(),
            schema_id: buf.get_u16_le(),
            version: buf.get_u16_le(),
        };
        if header.schema_id != SCHEMA_ID {
            return Err(DecodeError::UnsupportedSchema(header.schema_id));
        }
        Ok(header)
    }

    /// Read the header without consuming the buffer.
    pub fn peek(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut slice = bytes;
        Self::decode(&mut slice)
    }
}

/// A message with a fixed binary layout.
///
/// Implementors describe the fixed block and the variable-length tail; the
/// provided methods take care of the header and of skipping any fixed
/// fields appended by a newer schema version.
pub trait WireMessage: Sized {
    /// Template id written into the header.
    const TEMPLATE_ID: u16;

    /// Size of the fixed-field block this version writes.
    const BLOCK_LENGTH: u16;

    /// Size of the variable-length tail.
    fn var_length(&self) -> usize;

    /// Write the fixed-field block (exactly `BLOCK_LENGTH` bytes).
    fn encode_block(&self, buf: &mut BytesMut);

    /// Write the variable-length fields. Fails before writing a string
    /// its length prefix cannot describe.
    fn encode_var(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;

    /// Read the message from its fixed block and the bytes that follow it.
    fn decode_parts(block: &mut Bytes, tail: &mut Bytes) -> Result<Self, DecodeError>;

    /// Total encoded length, header included.
    fn encoded_len(&self) -> usize {
        HEADER_LENGTH + Self::BLOCK_LENGTH as usize + self.var_length()
    }

    /// Append the encoded message to `buf`. On error `buf` is left as it was.
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let start = buf.len();
        buf.reserve(self.encoded_len());
        MessageHeader::new(Self::TEMPLATE_ID, Self::BLOCK_LENGTH).encode(buf);
        self.encode_block(buf);
        if let Err(e) = self.encode_var(buf) {
            buf.truncate(start);
            return Err(e);
        }
        Ok(())
    }

    fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one message and advance `buf` past it.
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let header = MessageHeader::decode(buf)?;
        if header.template_id != Self::TEMPLATE_ID {
            return Err(DecodeError::UnexpectedTemplate {
                expected: Self::TEMPLATE_ID,
                actual: header.template_id,
            });
        }
        if header.block_length < Self::BLOCK_LENGTH {
            return Err(DecodeError::BlockTooShort {
                minimum: Self::BLOCK_LENGTH,
                actual: header.block_length,
            });
        }
        ensure(&*buf, header.block_length as usize)?;
        let mut block = buf.split_to(header.block_length as usize);
        Self::decode_parts(&mut block, buf)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&mut Bytes::copy_from_slice(bytes))
    }
}

pub(crate) fn ensure<B: Buf + ?Sized>(buf: &B, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn var_string_length(value: &str) -> usize {
    2 + value.len()
}

pub(crate) fn var_bytes_length(value: &[u8]) -> usize {
    4 + value.len()
}

pub(crate) fn put_var_string(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
) -> Result<(), EncodeError> {
    let length = u16::try_from(value.len()).map_err(|_| EncodeError::FieldTooLong {
        field,
        length: value.len(),
    })?;
    buf.put_u16_le(length);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn get_var_string(buf: &mut Bytes, field: &'static str) -> Result<String, DecodeError> {
    ensure(&*buf, 2)?;
    let length = buf.get_u16_le() as usize;
    ensure(&*buf, length)?;
    let raw = buf.split_to(length);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
}

pub(crate) fn put_var_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

pub(crate) fn get_var_bytes(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    ensure(&*buf, 4)?;
    let length = buf.get_u32_le() as usize;
    ensure(&*buf, length)?;
    Ok(buf.split_to(length))
}
