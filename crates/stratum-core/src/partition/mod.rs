// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partition actor: the single writer of a partition's log and state.
//!
//! ```text
//!   PartitionHandle ──mpsc──▶ actor ──append──▶ PartitionLog
//!                               │
//!                               ├─ StreamProcessor::process (one record at a time)
//!                               ├─ responses ──oneshot──▶ caller
//!                               └─ side effects ──▶ SubscriptionCommandSender
//! ```
//!
//! Every command is appended first, then processed from the log in position
//! order. Follow-up records carry the position of the record that produced
//! them, which is how recovery finds where processing stopped.

mod actor;
mod handle;
mod registry;

pub use handle::PartitionHandle;
pub use registry::PartitionRegistry;

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::correlation::SubscriptionCommandSender;
use crate::persistence::{
    LogBounds, LogStoreError, PartitionLog, PartitionSnapshot, SnapshotError, SnapshotStore,
};
use crate::state::PartitionState;

/// Entries read from the log per processing or replay batch.
pub(crate) const READ_BATCH_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition {0} is not running")]
    Closed(u16),

    #[error("log error: {0}")]
    Log(#[from] LogStoreError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("snapshot encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A command was processed without producing a response.
    #[error("command at position {0} produced no response")]
    NoResponse(u64),

    /// Log and snapshots on disk do not fit together.
    #[error("cannot recover partition {partition_id}: {reason}")]
    Recovery { partition_id: u16, reason: String },
}

/// Positions a partition reports after every step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionPositions {
    /// First position still in the log.
    pub first: u64,
    /// Last committed position.
    pub commit: u64,
    /// Last position processed by the stream processor.
    pub processed: u64,
    /// Last position confirmed by the exporter.
    pub exporter: u64,
    /// Position of the latest snapshot.
    pub snapshot: Option<u64>,
}

/// Settings of one partition.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    pub partition_id: u16,
    pub max_payload_size: usize,
    pub snapshot_chunk_size: usize,
}

impl PartitionOptions {
    pub fn new(partition_id: u16) -> Self {
        Self {
            partition_id,
            max_payload_size: Config::DEFAULT_MAX_PAYLOAD_SIZE,
            snapshot_chunk_size: Config::DEFAULT_SNAPSHOT_CHUNK_SIZE,
        }
    }

    pub fn from_config(config: &Config, partition_id: u16) -> Self {
        Self {
            partition_id,
            max_payload_size: config.max_payload_size,
            snapshot_chunk_size: config.snapshot_chunk_size,
        }
    }
}

/// State rebuilt from the latest snapshot and the log that follows it.
pub(crate) struct Recovered {
    pub state: PartitionState,
    pub processed_position: u64,
    pub snapshot_position: Option<u64>,
    pub bounds: LogBounds,
}

/// Opens partitions.
pub struct Partition;

impl Partition {
    /// Recover the partition from disk and start its actor.
    ///
    /// Records that were written but not processed before the last stop are
    /// processed before the first new request is taken.
    pub async fn open(
        options: PartitionOptions,
        log: PartitionLog,
        snapshots: SnapshotStore,
        sender: Arc<SubscriptionCommandSender>,
    ) -> Result<PartitionHandle, PartitionError> {
        let recovered = recover(options.partition_id, &log, &snapshots).await?;
        Ok(actor::spawn(options, log, snapshots, sender, recovered))
    }
}

/// Load the newest readable snapshot and replay the events written after it.
#[instrument(skip(log, snapshots))]
pub(crate) async fn recover(
    partition_id: u16,
    log: &PartitionLog,
    snapshots: &SnapshotStore,
) -> Result<Recovered, PartitionError> {
    let bounds = log.bounds().await?;

    let mut baseline = None;
    for position in snapshots.positions().await?.into_iter().rev() {
        match load_snapshot(snapshots, position).await {
            Ok(snapshot) => {
                baseline = Some(snapshot);
                break;
            }
            Err(e) => warn!(position, error = %e, "Skipping unreadable snapshot"),
        }
    }

    let (mut state, mut processed_position, snapshot_position) = match baseline {
        Some(snapshot) => {
            if snapshot.state.partition_id != partition_id {
                return Err(PartitionError::Recovery {
                    partition_id,
                    reason: format!(
                        "snapshot {} belongs to partition {}",
                        snapshot.position, snapshot.state.partition_id
                    ),
                });
            }
            (snapshot.state, snapshot.processed_position, Some(snapshot.position))
        }
        None => (PartitionState::new(partition_id), 0, None),
    };

    let replay_from = snapshot_position.map_or(1, |position| position + 1);
    if bounds.first > replay_from {
        return Err(PartitionError::Recovery {
            partition_id,
            reason: format!(
                "log starts at {} but replay must start at {}",
                bounds.first, replay_from
            ),
        });
    }

    let mut next = replay_from;
    let mut replayed = 0usize;
    while next <= bounds.commit {
        let entries = log.read(next, READ_BATCH_SIZE).await?;
        if entries.is_empty() {
            break;
        }
        for entry in entries {
            if entry.position > bounds.commit {
                break;
            }
            if entry.record.is_event() {
                state.apply(&entry.record);
            }
            if let Some(source) = entry.source_position {
                processed_position = processed_position.max(source);
            }
            next = entry.position + 1;
            replayed += 1;
        }
    }

    info!(
        partition_id,
        snapshot_position = ?snapshot_position,
        replayed,
        processed_position,
        commit_position = bounds.commit,
        "Partition recovered"
    );

    Ok(Recovered {
        state,
        processed_position,
        snapshot_position,
        bounds,
    })
}

async fn load_snapshot(
    snapshots: &SnapshotStore,
    position: u64,
) -> Result<PartitionSnapshot, PartitionError> {
    let content = snapshots.load(position).await?;
    Ok(PartitionSnapshot::from_slice(&content)?)
}

#[cfg(test)]
mod tests;
