// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratum Protocol - fixed binary messages and stream framing
//!
//! This crate provides the wire protocol spoken between stratum partitions:
//! - Subscription messages exchanged between a workflow instance partition
//!   and the partition owning a message subscription
//! - Replication messages used to restore a partition log from a peer
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    stratum-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: length + message type (FramedStream)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: header + fixed block + variable data (codec)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stratum_protocol::{FramedStream, RestoreInfoRequest, RestoreInfoResponse};
//!
//! let mut framed = FramedStream::new(stream);
//! let info: RestoreInfoResponse = framed
//!     .request(&RestoreInfoRequest { partition_id: 1, from_position: 1, backup_position: 40 })
//!     .await?;
//! ```

pub mod codec;
pub mod frame;
pub mod replication;
pub mod subscription;

pub use codec::{
    DecodeError, EncodeError, MAX_STRING_LENGTH, MessageHeader, NULL_KEY, NULL_PARTITION_ID,
    NULL_POSITION, WireMessage,
};
pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use replication::{
    ErrorResponse, LogBlock, LogBlockEntry, LogBlockRequest, ReplicationRequest,
    ReplicationTarget, RestoreInfoRequest, RestoreInfoResponse, SnapshotChunk,
    SnapshotChunkRequest,
};
pub use subscription::{
    CloseMessageSubscription, CorrelateMessageSubscription, CorrelateWorkflowInstanceSubscription,
    OpenMessageSubscription, OpenWorkflowInstanceSubscription, SubscriptionAddress,
    SubscriptionCommand,
};
