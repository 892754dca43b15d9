// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log and snapshot replication between a source partition and a restoring
//! replica.
//!
//! A restore session runs through these states:
//!
//! ```text
//! REQUEST_INFO ──▶ REPLICATE_EVENTS ─────────────────────┐
//!      │                                                 ▼
//!      └─────────▶ REPLICATE_SNAPSHOT ──▶ (events) ──▶ DONE
//!
//! any state ──▶ FAILED
//! ```
//!
//! The source decides between replaying events and sending a snapshot with
//! [`decide`]; the target drives the transfer with [`RestoreController`].

mod controller;
mod framed;
mod source;

pub use controller::{RestoreController, RestoreError, RestoreHandle, RestoreProgress, RestoreState};
pub use framed::{FramedReplicationClient, ReplicationServer};
pub use source::PartitionReplicationSource;

use async_trait::async_trait;
use thiserror::Error;

use stratum_protocol::{
    DecodeError, EncodeError, ErrorResponse, FrameError, LogBlock, ReplicationTarget,
    RestoreInfoResponse, SnapshotChunk,
};

use crate::persistence::{LogStoreError, SnapshotError};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("log error: {0}")]
    Log(#[from] LogStoreError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("transport error: {0}")]
    Transport(#[from] FrameError),

    #[error("malformed log block: {0}")]
    Decode(#[from] DecodeError),

    #[error("response cannot be encoded: {0}")]
    Encode(#[from] EncodeError),

    #[error("partition {0} is not served here")]
    UnknownPartition(u16),

    /// The requested positions were compacted away.
    #[error("position {requested} is no longer in the log, which starts at {first}")]
    Compacted { requested: u64, first: u64 },
}

impl ReplicationError {
    /// Error response sent to a remote requester.
    pub fn to_response(&self) -> ErrorResponse {
        let code = match self {
            Self::UnknownPartition(_)
            | Self::Compacted { .. }
            | Self::Snapshot(SnapshotError::NotFound(_))
            | Self::Snapshot(SnapshotError::ChunkOutOfRange { .. }) => ErrorResponse::NOT_FOUND,
            Self::Decode(_) => ErrorResponse::BAD_REQUEST,
            _ => ErrorResponse::INTERNAL,
        };
        ErrorResponse::new(code, self.to_string())
    }
}

/// Where a restoring replica reads log blocks and snapshot chunks from.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// How the range `[from_position, backup_position]` can be restored.
    async fn restore_info(
        &self,
        from_position: u64,
        backup_position: u64,
    ) -> Result<RestoreInfoResponse, ReplicationError>;

    /// Committed entries starting at `from_position`.
    async fn log_block(&self, from_position: u64, max_entries: u32) -> Result<LogBlock, ReplicationError>;

    async fn snapshot_chunk(
        &self,
        snapshot_position: u64,
        chunk_index: u32,
    ) -> Result<SnapshotChunk, ReplicationError>;
}

/// Everything the restore decision looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreInputs {
    pub from_position: u64,
    pub backup_position: u64,
    /// First position still in the source log.
    pub log_first: u64,
    pub log_commit: u64,
    pub exporter_position: u64,
    pub processed_position: u64,
    /// Latest complete snapshot of the source.
    pub snapshot_position: Option<u64>,
}

/// Choose how a replica restores `[from_position, backup_position]`.
///
/// Events are preferred when the retained log covers the range and the
/// snapshot adds nothing the exporter has not already seen. A snapshot is
/// chosen when it reaches the backup position, or when it starts inside the
/// range and the log continues right after it. A snapshot newer than the
/// backup position is acceptable: it is authoritative for its position.
pub fn decide(inputs: &RestoreInputs) -> RestoreInfoResponse {
    let none = RestoreInfoResponse {
        target: ReplicationTarget::None,
        snapshot_position: None,
    };
    let events = RestoreInfoResponse {
        target: ReplicationTarget::Events,
        snapshot_position: None,
    };

    let RestoreInputs {
        from_position: from,
        backup_position: backup,
        log_first,
        log_commit,
        exporter_position,
        processed_position,
        snapshot_position,
    } = *inputs;

    if from == 0 || from > backup || backup > log_commit {
        return none;
    }
    // a snapshot ahead of processing does not reflect the log yet
    let snapshot = snapshot_position.filter(|&position| position <= processed_position);
    let log_covers_range = log_first <= from;

    match snapshot {
        None if log_covers_range => events,
        Some(position) if log_covers_range && position <= exporter_position => events,
        Some(position) if position >= backup => RestoreInfoResponse {
            target: ReplicationTarget::Snapshot,
            snapshot_position: Some(position),
        },
        Some(position) if position >= from && log_first <= position + 1 => RestoreInfoResponse {
            target: ReplicationTarget::Snapshot,
            snapshot_position: Some(position),
        },
        _ if log_covers_range => events,
        _ => none,
    }
}
