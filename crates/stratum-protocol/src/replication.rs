// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages exchanged while restoring a partition log from a peer.
//!
//! A restoring replica first asks which kind of data the peer can offer for
//! a position range (`RestoreInfoRequest`), then pulls either blocks of log
//! entries or the chunks of a snapshot.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    DecodeError, EncodeError, MessageHeader, NULL_POSITION, WireMessage, ensure, get_var_bytes,
    get_var_string, put_var_bytes, put_var_string, var_bytes_length, var_string_length,
};

/// What a peer can offer for a restore range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationTarget {
    /// Replay events starting at the requested position.
    Events = 0,
    /// Install a snapshot, then replay the events that follow it.
    Snapshot = 1,
    /// Nothing usable for this range.
    None = 2,
}

impl TryFrom<u8> for ReplicationTarget {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReplicationTarget::Events),
            1 => Ok(ReplicationTarget::Snapshot),
            2 => Ok(ReplicationTarget::None),
            _ => Err(DecodeError::InvalidValue {
                field: "target",
                value: value as u64,
            }),
        }
    }
}

fn position_from_wire(value: u64) -> Option<u64> {
    (value != NULL_POSITION).then_some(value)
}

/// Ask a peer how it can help restore `[from_position, backup_position]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreInfoRequest {
    pub partition_id: u16,
    pub from_position: u64,
    pub backup_position: u64,
}

impl WireMessage for RestoreInfoRequest {
    const TEMPLATE_ID: u16 = 10;
    const BLOCK_LENGTH: u16 = 18;

    fn var_length(&self) -> usize {
        0
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.partition_id);
        buf.put_u64_le(self.from_position);
        buf.put_u64_le(self.backup_position);
    }

    fn encode_var(&self, _buf: &mut BytesMut) -> Result<(), EncodeError> {
        Ok(())
    }

    fn decode_parts(block: &mut Bytes, _tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            partition_id: block.get_u16_le(),
            from_position: block.get_u64_le(),
            backup_position: block.get_u64_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreInfoResponse {
    pub target: ReplicationTarget,
    /// Position of the offered snapshot, only set for `Snapshot`.
    pub snapshot_position: Option<u64>,
}

impl WireMessage for RestoreInfoResponse {
    const TEMPLATE_ID: u16 = 11;
    const BLOCK_LENGTH: u16 = 9;

    fn var_length(&self) -> usize {
        0
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        buf.put_u8(self.target as u8);
        buf.put_u64_le(self.snapshot_position.unwrap_or(NULL_POSITION));
    }

    fn encode_var(&self, _buf: &mut BytesMut) -> Result<(), EncodeError> {
        Ok(())
    }

    fn decode_parts(block: &mut Bytes, _tail: &mut Bytes) -> Result<Self, DecodeError> {
        let target = ReplicationTarget::try_from(block.get_u8())?;
        let snapshot_position = position_from_wire(block.get_u64_le());
        Ok(Self {
            target,
            snapshot_position,
        })
    }
}

/// Pull up to `max_entries` committed log entries starting at `from_position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBlockRequest {
    pub partition_id: u16,
    pub from_position: u64,
    pub max_entries: u32,
}

impl WireMessage for LogBlockRequest {
    const TEMPLATE_ID: u16 = 12;
    const BLOCK_LENGTH: u16 = 14;

    fn var_length(&self) -> usize {
        0
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.partition_id);
        buf.put_u64_le(self.from_position);
        buf.put_u32_le(self.max_entries);
    }

    fn encode_var(&self, _buf: &mut BytesMut) -> Result<(), EncodeError> {
        Ok(())
    }

    fn decode_parts(block: &mut Bytes, _tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            partition_id: block.get_u16_le(),
            from_position: block.get_u64_le(),
            max_entries: block.get_u32_le(),
        })
    }
}

/// One serialized log entry inside a [`LogBlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlockEntry {
    pub position: u64,
    pub data: Bytes,
}

/// A contiguous run of log entries.
///
/// Entries are packed as `position (u64) | length (u32) | data`. An empty
/// block means the peer has nothing at or after the requested position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlock {
    /// Commit position of the sending log at the time of the read.
    pub commit_position: u64,
    pub entries: Bytes,
}

impl LogBlock {
    pub fn from_entries(commit_position: u64, entries: &[LogBlockEntry]) -> Self {
        let size = entries.iter().map(|e| 12 + e.data.len()).sum();
        let mut buf = BytesMut::with_capacity(size);
        for entry in entries {
            buf.put_u64_le(entry.position);
            buf.put_u32_le(entry.data.len() as u32);
            buf.put_slice(&entry.data);
        }
        Self {
            commit_position,
            entries: buf.freeze(),
        }
    }

    pub fn entries(&self) -> Result<Vec<LogBlockEntry>, DecodeError> {
        let mut buf = self.entries.clone();
        let mut entries = Vec::new();
        while buf.has_remaining() {
            ensure(&buf, 12)?;
            let position = buf.get_u64_le();
            let length = buf.get_u32_le() as usize;
            ensure(&buf, length)?;
            entries.push(LogBlockEntry {
                position,
                data: buf.split_to(length),
            });
        }
        Ok(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl WireMessage for LogBlock {
    const TEMPLATE_ID: u16 = 13;
    const BLOCK_LENGTH: u16 = 8;

    fn var_length(&self) -> usize {
        var_bytes_length(&self.entries)
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.commit_position);
    }

    fn encode_var(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_var_bytes(buf, &self.entries);
        Ok(())
    }

    fn decode_parts(block: &mut Bytes, tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            commit_position: block.get_u64_le(),
            entries: get_var_bytes(tail)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotChunkRequest {
    pub partition_id: u16,
    pub snapshot_position: u64,
    pub chunk_index: u32,
}

impl WireMessage for SnapshotChunkRequest {
    const TEMPLATE_ID: u16 = 14;
    const BLOCK_LENGTH: u16 = 14;

    fn var_length(&self) -> usize {
        0
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.partition_id);
        buf.put_u64_le(self.snapshot_position);
        buf.put_u32_le(self.chunk_index);
    }

    fn encode_var(&self, _buf: &mut BytesMut) -> Result<(), EncodeError> {
        Ok(())
    }

    fn decode_parts(block: &mut Bytes, _tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            partition_id: block.get_u16_le(),
            snapshot_position: block.get_u64_le(),
            chunk_index: block.get_u32_le(),
        })
    }
}

/// A single snapshot chunk with the checksum it must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub snapshot_position: u64,
    pub total_count: u32,
    pub checksum: u64,
    pub name: String,
    pub content: Bytes,
}

impl WireMessage for SnapshotChunk {
    const TEMPLATE_ID: u16 = 15;
    const BLOCK_LENGTH: u16 = 20;

    fn var_length(&self) -> usize {
        var_string_length(&self.name) + var_bytes_length(&self.content)
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.snapshot_position);
        buf.put_u32_le(self.total_count);
        buf.put_u64_le(self.checksum);
    }

    fn encode_var(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_var_string(buf, "name", &self.name)?;
        put_var_bytes(buf, &self.content);
        Ok(())
    }

    fn decode_parts(block: &mut Bytes, tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            snapshot_position: block.get_u64_le(),
            total_count: block.get_u32_le(),
            checksum: block.get_u64_le(),
            name: get_var_string(tail, "name")?,
            content: get_var_bytes(tail)?,
        })
    }
}

/// Returned in place of a response when the peer could not serve a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

impl ErrorResponse {
    pub const NOT_FOUND: u16 = 1;
    pub const INTERNAL: u16 = 2;
    pub const BAD_REQUEST: u16 = 3;

    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl WireMessage for ErrorResponse {
    const TEMPLATE_ID: u16 = 16;
    const BLOCK_LENGTH: u16 = 2;

    fn var_length(&self) -> usize {
        var_string_length(&self.message)
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.code);
    }

    fn encode_var(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_var_string(buf, "message", &self.message)
    }

    fn decode_parts(block: &mut Bytes, tail: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            code: block.get_u16_le(),
            message: get_var_string(tail, "message")?,
        })
    }
}

/// Requests a replication server can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationRequest {
    RestoreInfo(RestoreInfoRequest),
    LogBlock(LogBlockRequest),
    SnapshotChunk(SnapshotChunkRequest),
}

impl ReplicationRequest {
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let header = MessageHeader::peek(buf)?;
        Ok(match header.template_id {
            RestoreInfoRequest::TEMPLATE_ID => Self::RestoreInfo(RestoreInfoRequest::decode(buf)?),
            LogBlockRequest::TEMPLATE_ID => Self::LogBlock(LogBlockRequest::decode(buf)?),
            SnapshotChunkRequest::TEMPLATE_ID => {
                Self::SnapshotChunk(SnapshotChunkRequest::decode(buf)?)
            }
            other => return Err(DecodeError::UnknownTemplate(other)),
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        match self {
            Self::RestoreInfo(m) => m.to_bytes(),
            Self::LogBlock(m) => m.to_bytes(),
            Self::SnapshotChunk(m) => m.to_bytes(),
        }
    }

    /// Partition whose log or snapshots the request reads.
    pub fn partition_id(&self) -> u16 {
        match self {
            Self::RestoreInfo(m) => m.partition_id,
            Self::LogBlock(m) => m.partition_id,
            Self::SnapshotChunk(m) => m.partition_id,
        }
    }
}
