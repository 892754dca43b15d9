// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use stratum_protocol::{LogBlock, LogBlockEntry, RestoreInfoResponse, SnapshotChunk};

use super::{ReplicationError, ReplicationSource, RestoreInputs, decide};
use crate::partition::{PartitionHandle, PartitionPositions};
use crate::persistence::{PartitionLog, SnapshotStore};

/// Serves the log and snapshots of a local partition to restoring replicas.
#[derive(Clone)]
pub struct PartitionReplicationSource {
    partition_id: u16,
    log: PartitionLog,
    snapshots: SnapshotStore,
    positions: watch::Receiver<PartitionPositions>,
}

impl PartitionReplicationSource {
    pub fn new(partition: &PartitionHandle) -> Self {
        Self {
            partition_id: partition.partition_id(),
            log: partition.log().clone(),
            snapshots: partition.snapshots().clone(),
            positions: partition.watch_positions(),
        }
    }

    pub fn partition_id(&self) -> u16 {
        self.partition_id
    }
}

#[async_trait]
impl ReplicationSource for PartitionReplicationSource {
    #[instrument(skip(self), fields(partition_id = self.partition_id))]
    async fn restore_info(
        &self,
        from_position: u64,
        backup_position: u64,
    ) -> Result<RestoreInfoResponse, ReplicationError> {
        let bounds = self.log.bounds().await?;
        let positions = *self.positions.borrow();
        let snapshot_position = self
            .snapshots
            .latest()
            .await?
            .map(|metadata| metadata.position);

        let decision = decide(&RestoreInputs {
            from_position,
            backup_position,
            log_first: bounds.first,
            log_commit: bounds.commit,
            exporter_position: positions.exporter,
            processed_position: positions.processed,
            snapshot_position,
        });
        info!(
            target_kind = ?decision.target,
            snapshot_position = ?decision.snapshot_position,
            log_first = bounds.first,
            log_commit = bounds.commit,
            "Restore target chosen"
        );
        Ok(decision)
    }

    async fn log_block(
        &self,
        from_position: u64,
        max_entries: u32,
    ) -> Result<LogBlock, ReplicationError> {
        let bounds = self.log.bounds().await?;
        if from_position < bounds.first {
            return Err(ReplicationError::Compacted {
                requested: from_position,
                first: bounds.first,
            });
        }

        let entries: Vec<LogBlockEntry> = self
            .log
            .store()
            .read(from_position, max_entries.max(1) as usize)
            .await?
            .into_iter()
            .take_while(|entry| entry.position <= bounds.commit)
            .map(|entry| LogBlockEntry {
                position: entry.position,
                data: entry.data,
            })
            .collect();
        debug!(
            partition_id = self.partition_id,
            from_position,
            count = entries.len(),
            "Serving log block"
        );
        Ok(LogBlock::from_entries(bounds.commit, &entries))
    }

    async fn snapshot_chunk(
        &self,
        snapshot_position: u64,
        chunk_index: u32,
    ) -> Result<SnapshotChunk, ReplicationError> {
        Ok(self.snapshots.read_chunk(snapshot_position, chunk_index).await?)
    }
}
