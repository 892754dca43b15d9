// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process cluster: nodes, partition leaders and message delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::warn;

use super::{ClusterTransport, NodeId, SubscriptionMessageHandler, TopologyProvider, TransportError};

#[derive(Default)]
struct ClusterMembers {
    nodes: BTreeMap<NodeId, Arc<SubscriptionMessageHandler>>,
    leaders: BTreeMap<u16, NodeId>,
    partition_ids: BTreeSet<u16>,
    unreachable: BTreeSet<NodeId>,
}

/// Cluster whose nodes all live in this process.
///
/// Delivers a message by handing it straight to the target node's
/// [`SubscriptionMessageHandler`]. Nodes can be marked unreachable and
/// leaders moved to exercise the retry paths.
#[derive(Default)]
pub struct LocalCluster {
    members: RwLock<ClusterMembers>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_node(&self, handler: Arc<SubscriptionMessageHandler>) {
        let mut members = self.members.write().await;
        members.nodes.insert(handler.node_id(), handler);
    }

    pub async fn set_leader(&self, partition_id: u16, node: NodeId) {
        let mut members = self.members.write().await;
        members.leaders.insert(partition_id, node);
        members.partition_ids.insert(partition_id);
    }

    pub async fn remove_leader(&self, partition_id: u16) {
        self.members.write().await.leaders.remove(&partition_id);
    }

    /// Declare the partition ids the topology reports.
    pub async fn set_partition_ids(&self, partition_ids: impl IntoIterator<Item = u16>) {
        self.members.write().await.partition_ids = partition_ids.into_iter().collect();
    }

    pub async fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut members = self.members.write().await;
        if unreachable {
            members.unreachable.insert(node);
        } else {
            members.unreachable.remove(&node);
        }
    }
}

#[async_trait]
impl ClusterTransport for LocalCluster {
    async fn leader_of(&self, partition_id: u16) -> Option<NodeId> {
        self.members.read().await.leaders.get(&partition_id).copied()
    }

    async fn send(&self, node: NodeId, message: Bytes) -> Result<(), TransportError> {
        let handler = {
            let members = self.members.read().await;
            if members.unreachable.contains(&node) {
                return Err(TransportError::Unreachable(node));
            }
            members
                .nodes
                .get(&node)
                .cloned()
                .ok_or(TransportError::Unreachable(node))?
        };

        // fire-and-forget: the receiver's verdict never reaches the sender
        if let Err(e) = handler.handle(message).await {
            warn!(node_id = node, error = %e, "Subscription message discarded");
        }
        Ok(())
    }
}

#[async_trait]
impl TopologyProvider for LocalCluster {
    async fn partition_ids(&self) -> Result<Vec<u16>, TransportError> {
        let members = self.members.read().await;
        if members.partition_ids.is_empty() {
            return Err(TransportError::Topology(
                "no partitions registered".to_string(),
            ));
        }
        Ok(members.partition_ids.iter().copied().collect())
    }
}
