// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Target side of a restore session.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use stratum_protocol::{DecodeError, ReplicationTarget};

use super::{ReplicationError, ReplicationSource};
use crate::persistence::{LogStore, LogStoreError, PendingSnapshot, SnapshotError, SnapshotStore, StoredEntry};

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("source has nothing to restore [{from}, {backup}] from")]
    NothingToRestore { from: u64, backup: u64 },

    #[error("invalid restore range [{from}, {backup}]")]
    InvalidRange { from: u64, backup: u64 },

    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("target log error: {0}")]
    Log(#[from] LogStoreError),

    #[error("target snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("malformed log block: {0}")]
    Decode(#[from] DecodeError),

    #[error("log block out of order: expected position {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },

    #[error("source log ends at {commit} before backup position {backup}")]
    Truncated { commit: u64, backup: u64 },

    #[error("target log continues at {next}, cannot restore from {from}")]
    TargetMismatch { next: u64, from: u64 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("restore runtime error: {0}")]
    Runtime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    RequestInfo,
    ReplicateEvents,
    ReplicateSnapshot,
    Done,
    Failed,
}

/// Progress of a restore session, published after every block or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreProgress {
    pub state: RestoreState,
    /// Last position written to the target.
    pub position: u64,
    pub chunks_received: u32,
    pub entries_received: u64,
}

impl Default for RestoreProgress {
    fn default() -> Self {
        Self {
            state: RestoreState::RequestInfo,
            position: 0,
            chunks_received: 0,
            entries_received: 0,
        }
    }
}

/// Entries of one log block, checked and trimmed to the backup position.
struct FetchedBlock {
    entries: Vec<StoredEntry>,
    commit_position: u64,
    /// Position following the last entry.
    next: u64,
}

/// Restores one target partition from a [`ReplicationSource`].
///
/// The target log and snapshot store must not be in use by a running
/// partition while a restore is in progress.
pub struct RestoreController {
    partition_id: u16,
    source: Arc<dyn ReplicationSource>,
    log: Arc<dyn LogStore>,
    snapshots: SnapshotStore,
    block_size: u32,
    progress: watch::Sender<RestoreProgress>,
}

impl std::fmt::Debug for RestoreController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreController")
            .field("partition_id", &self.partition_id)
            .field("snapshots", &self.snapshots.dir())
            .field("block_size", &self.block_size)
            .field("progress", &*self.progress.borrow())
            .finish()
    }
}

impl RestoreController {
    pub fn new(
        partition_id: u16,
        source: Arc<dyn ReplicationSource>,
        log: Arc<dyn LogStore>,
        snapshots: SnapshotStore,
        block_size: u32,
    ) -> Self {
        let (progress, _) = watch::channel(RestoreProgress::default());
        Self {
            partition_id,
            source,
            log,
            snapshots,
            block_size: block_size.max(1),
            progress,
        }
    }

    pub fn progress(&self) -> watch::Receiver<RestoreProgress> {
        self.progress.subscribe()
    }

    /// Bring the target up to `backup_position`, starting at
    /// `from_position`. Returns the position the target now holds, which is
    /// past `backup_position` when the source offered a newer snapshot.
    #[instrument(skip(self), fields(partition_id = self.partition_id, session_id = %Uuid::new_v4()))]
    pub async fn restore(&self, from_position: u64, backup_position: u64) -> Result<u64, RestoreError> {
        let result = self.run(from_position, backup_position).await;
        match &result {
            Ok(position) => {
                info!(position, "Restore complete");
                self.progress.send_modify(|p| {
                    p.state = RestoreState::Done;
                    p.position = *position;
                });
            }
            Err(e) => {
                error!(error = %e, "Restore failed");
                self.progress.send_modify(|p| p.state = RestoreState::Failed);
            }
        }
        result
    }

    async fn run(&self, from: u64, backup: u64) -> Result<u64, RestoreError> {
        if from == 0 || from > backup {
            return Err(RestoreError::InvalidRange { from, backup });
        }

        self.set_state(RestoreState::RequestInfo);
        let info = self.source.restore_info(from, backup).await?;
        debug!(target_kind = ?info.target, snapshot_position = ?info.snapshot_position, "Received restore info");

        match info.target {
            ReplicationTarget::None => Err(RestoreError::NothingToRestore { from, backup }),
            ReplicationTarget::Events => {
                self.prepare_log(from).await?;
                self.replicate_events(from, backup).await?;
                Ok(backup)
            }
            ReplicationTarget::Snapshot => {
                let position = info.snapshot_position.ok_or_else(|| {
                    RestoreError::Protocol("snapshot target without a snapshot position".to_string())
                })?;
                self.replicate_snapshot(position, backup).await?;
                Ok(position.max(backup))
            }
        }
    }

    /// The target log must be empty or end right before `from`.
    async fn prepare_log(&self, from: u64) -> Result<(), RestoreError> {
        let bounds = self.log.bounds().await?;
        if bounds.next == from {
            return Ok(());
        }
        if bounds.is_empty() {
            self.log.reset(from).await?;
            return Ok(());
        }
        Err(RestoreError::TargetMismatch {
            next: bounds.next,
            from,
        })
    }

    /// Copy `[from, backup]` block by block. Every written block extends the
    /// target log by a gap-free prefix, so a failure leaves a valid log.
    async fn replicate_events(&self, from: u64, backup: u64) -> Result<(), RestoreError> {
        self.set_state(RestoreState::ReplicateEvents);
        let mut next = from;
        while next <= backup {
            let block = self.fetch_block(next, backup).await?;
            next = block.next;
            self.write_block(block).await?;
        }
        Ok(())
    }

    /// Receive the snapshot at `position` and the events up to `backup`
    /// that follow it. The target keeps its previous log and snapshots
    /// until both transfers are complete and valid.
    async fn replicate_snapshot(&self, position: u64, backup: u64) -> Result<(), RestoreError> {
        self.set_state(RestoreState::ReplicateSnapshot);
        let mut pending = self.snapshots.begin_receive(position).await?;

        let tail = match self.receive_session(&mut pending, position, backup).await {
            Ok(tail) => tail,
            Err(e) => {
                pending.abort().await;
                return Err(e);
            }
        };

        let metadata = pending.commit().await?;
        self.log.reset(position + 1).await?;
        self.progress.send_modify(|p| p.position = position);
        info!(position, chunks = metadata.chunk_count(), "Snapshot received");
        for block in tail {
            self.write_block(block).await?;
        }
        self.snapshots.purge_older_than(position).await?;
        Ok(())
    }

    async fn receive_session(
        &self,
        pending: &mut PendingSnapshot,
        position: u64,
        backup: u64,
    ) -> Result<Vec<FetchedBlock>, RestoreError> {
        self.receive_chunks(pending).await?;
        if backup <= position {
            return Ok(Vec::new());
        }

        self.set_state(RestoreState::ReplicateEvents);
        let mut tail = Vec::new();
        let mut next = position + 1;
        while next <= backup {
            let block = self.fetch_block(next, backup).await?;
            next = block.next;
            tail.push(block);
        }
        Ok(tail)
    }

    /// Request the block starting at `next` and keep the entries up to
    /// `backup`, checking that positions continue without gaps.
    async fn fetch_block(&self, next: u64, backup: u64) -> Result<FetchedBlock, RestoreError> {
        let block = self.source.log_block(next, self.block_size).await?;
        let entries = block.entries()?;
        if entries.is_empty() {
            return Err(RestoreError::Truncated {
                commit: block.commit_position,
                backup,
            });
        }

        let mut expected = next;
        let mut batch = Vec::with_capacity(entries.len());
        for entry in entries {
            if expected > backup {
                break;
            }
            if entry.position != expected {
                return Err(RestoreError::OutOfOrder {
                    expected,
                    actual: entry.position,
                });
            }
            batch.push(StoredEntry {
                position: entry.position,
                data: entry.data,
            });
            expected += 1;
        }
        self.progress
            .send_modify(|p| p.entries_received += batch.len() as u64);
        Ok(FetchedBlock {
            entries: batch,
            commit_position: block.commit_position,
            next: expected,
        })
    }

    async fn write_block(&self, block: FetchedBlock) -> Result<(), RestoreError> {
        let last = block.next - 1;
        self.log.append(&block.entries).await?;
        self.log
            .set_commit_position(last.min(block.commit_position))
            .await?;
        self.progress.send_modify(|p| p.position = last);
        debug!(position = last, count = block.entries.len(), "Log block written");
        Ok(())
    }

    async fn receive_chunks(&self, pending: &mut PendingSnapshot) -> Result<(), RestoreError> {
        let position = pending.position();
        let mut index = 0;
        let mut total = 1;

        while index < total {
            let chunk = self.source.snapshot_chunk(position, index).await?;
            pending.apply(&chunk).await?;
            total = chunk.total_count;
            index += 1;
            self.progress.send_modify(|p| p.chunks_received = index);
        }
        Ok(())
    }

    fn set_state(&self, state: RestoreState) {
        self.progress.send_modify(|p| p.state = state);
    }

    /// Run the restore on a dedicated thread with its own single-threaded
    /// runtime so a long catch-up never competes with partition processing.
    ///
    /// A network-backed source keeps using the runtime its connection was
    /// opened on, which must outlive the restore.
    pub fn spawn(self, from_position: u64, backup_position: u64) -> Result<RestoreHandle, RestoreError> {
        let progress = self.progress();
        let (result_tx, result_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name(format!("restore-{}", self.partition_id))
            .spawn(move || {
                let result = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| RestoreError::Runtime(e.to_string()))
                    .and_then(|runtime| {
                        runtime.block_on(self.restore(from_position, backup_position))
                    });
                let _ = result_tx.send(result);
            })
            .map_err(|e| RestoreError::Runtime(e.to_string()))?;

        Ok(RestoreHandle {
            progress,
            result: result_rx,
        })
    }
}

/// A restore running in the background.
#[derive(Debug)]
pub struct RestoreHandle {
    progress: watch::Receiver<RestoreProgress>,
    result: oneshot::Receiver<Result<u64, RestoreError>>,
}

impl RestoreHandle {
    pub fn progress(&self) -> watch::Receiver<RestoreProgress> {
        self.progress.clone()
    }

    /// Wait for the restore to finish without blocking the calling thread.
    pub async fn wait(self) -> Result<u64, RestoreError> {
        self.result
            .await
            .map_err(|_| RestoreError::Runtime("restore thread exited without a result".to_string()))?
    }
}
