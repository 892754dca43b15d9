// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::PartitionHandle;

/// Partitions hosted by this node, by id.
#[derive(Clone, Default)]
pub struct PartitionRegistry {
    partitions: Arc<RwLock<BTreeMap<u16, PartitionHandle>>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a partition, replacing any previous handle with the same id.
    pub async fn register(&self, handle: PartitionHandle) -> Option<PartitionHandle> {
        self.partitions
            .write()
            .await
            .insert(handle.partition_id(), handle)
    }

    pub async fn get(&self, partition_id: u16) -> Option<PartitionHandle> {
        self.partitions.read().await.get(&partition_id).cloned()
    }

    pub async fn remove(&self, partition_id: u16) -> Option<PartitionHandle> {
        self.partitions.write().await.remove(&partition_id)
    }

    pub async fn ids(&self) -> Vec<u16> {
        self.partitions.read().await.keys().copied().collect()
    }

    pub async fn all(&self) -> Vec<PartitionHandle> {
        self.partitions.read().await.values().cloned().collect()
    }
}
