// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-partition message correlation.
//!
//! A workflow instance waiting for a message opens a subscription on the
//! partition its correlation key hashes to. The two partitions talk through
//! the fixed binary messages of [`stratum_protocol::subscription`], sent
//! fire-and-forget to the current leader of the target partition:
//!
//! ```text
//! workflow partition                         message partition
//!   WISub OPENING  ── OpenMessageSubscription ──────▶  MSub OPENED
//!   WISub OPENED   ◀── OpenWorkflowInstanceSubscription ──
//!   WISub CORRELATED ◀── CorrelateWorkflowInstanceSubscription ── MSub CORRELATING
//!                    ── CorrelateMessageSubscription ──▶  MSub CORRELATED
//! ```
//!
//! Delivery is at-least-once, every receiving handler is idempotent.

mod cluster;
mod receiver;
mod sender;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use stratum_protocol::{EncodeError, NULL_PARTITION_ID, SubscriptionCommand};

pub use cluster::LocalCluster;
pub use receiver::{ReceiveError, SubscriptionMessageHandler, subscription_command_record};
pub use sender::SubscriptionCommandSender;

/// Identifier of a node in the cluster.
pub type NodeId = u32;

/// Hash of a correlation key, identical on every node.
///
/// `h = 31 * h + byte` over the UTF-8 bytes, wrapping in 32 bits.
pub fn subscription_hash(correlation_key: &str) -> i32 {
    correlation_key
        .as_bytes()
        .iter()
        .fold(0i32, |hash, byte| {
            hash.wrapping_mul(31).wrapping_add(*byte as i32)
        })
}

/// Partition a correlation key routes to, given the known partition ids.
pub fn subscription_partition_id(correlation_key: &str, partition_ids: &[u16]) -> Option<u16> {
    if partition_ids.is_empty() {
        return None;
    }
    let count = partition_ids.len() as i64;
    let index = (subscription_hash(correlation_key) as i64 % count).unsigned_abs() as usize;
    partition_ids.get(index).copied()
}

/// Outcome of handing a subscription message to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the leader of the target partition.
    Delivered,
    /// Target not resolvable yet (no partition ids or no known leader);
    /// retry once topology is known.
    Pending,
    /// Received by a node that does not lead the target partition.
    Dropped,
}

/// A subscription message waiting to be sent.
///
/// When the message's subscription partition id is the null sentinel it is
/// resolved by hashing `correlation_key` right before sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub command: SubscriptionCommand,
    pub correlation_key: Option<String>,
}

impl SubscriptionRequest {
    pub fn new(command: impl Into<SubscriptionCommand>) -> Self {
        Self {
            command: command.into(),
            correlation_key: None,
        }
    }

    pub fn hashed_by(mut self, correlation_key: impl Into<String>) -> Self {
        self.correlation_key = Some(correlation_key.into());
        self
    }

    pub fn needs_subscription_partition(&self) -> bool {
        self.command.address().subscription_partition_id == NULL_PARTITION_ID
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("topology unavailable: {0}")]
    Topology(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("subscription message for '{0}' has no partition and no correlation key")]
    Unroutable(String),

    #[error("subscription message cannot be encoded: {0}")]
    Encode(#[from] EncodeError),
}

/// Delivers encoded messages to nodes and knows who leads which partition.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Current leader of `partition_id`, if known.
    async fn leader_of(&self, partition_id: u16) -> Option<NodeId>;

    /// Send one encoded subscription message to `node`.
    async fn send(&self, node: NodeId, message: Bytes) -> Result<(), TransportError>;
}

/// Source of the cluster's partition ids.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn partition_ids(&self) -> Result<Vec<u16>, TransportError>;
}
