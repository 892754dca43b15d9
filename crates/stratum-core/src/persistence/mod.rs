// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable storage of a partition: the append-only log and its snapshots.
//!
//! The log is an ordered sequence of entries at contiguous positions starting
//! at 1. [`LogStore`] is the storage abstraction; [`PartitionLog`] layers the
//! record encoding on top of it.

pub mod memory;
pub mod snapshot;
pub mod sqlite;

pub use self::memory::MemoryLogStore;
pub use self::snapshot::{
    ChunkInfo, PendingSnapshot, SnapshotError, SnapshotMetadata, SnapshotStore, checksum,
};
pub use self::sqlite::SqliteLogStore;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Record;
use crate::state::PartitionState;

/// Errors raised by log storage.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An append did not continue the log.
    #[error("non-contiguous append: expected position {expected}, got {actual}")]
    NonContiguous { expected: u64, actual: u64 },

    /// A position outside the log was used where an existing one is required.
    #[error("position {position} is outside the log [{first}, {next})")]
    OutOfRange { position: u64, first: u64, next: u64 },

    /// A stored entry could not be decoded.
    #[error("log entry at position {position} is corrupt: {details}")]
    Corrupt { position: u64, details: String },
}

/// Raw entry as held by a [`LogStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub position: u64,
    pub data: Bytes,
}

/// Bounds of a log.
///
/// Holds entries in `[first, next)`. Everything up to `commit` is durable and
/// may be processed or replicated. An empty log has `first == next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBounds {
    pub first: u64,
    pub next: u64,
    pub commit: u64,
}

impl LogBounds {
    pub fn is_empty(&self) -> bool {
        self.first >= self.next
    }

    /// Last written position, if any.
    pub fn last(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.next - 1)
    }
}

/// Storage for the entries of one partition log.
#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    /// Append entries. They must be contiguous and start at the next position.
    async fn append(&self, entries: &[StoredEntry]) -> Result<(), LogStoreError>;

    /// Read up to `max_entries` entries starting at `from` (clamped to the
    /// first position).
    async fn read(&self, from: u64, max_entries: usize) -> Result<Vec<StoredEntry>, LogStoreError>;

    async fn bounds(&self) -> Result<LogBounds, LogStoreError>;

    /// Mark everything up to `position` as committed.
    async fn set_commit_position(&self, position: u64) -> Result<(), LogStoreError>;

    /// Delete every entry at or below `up_to`.
    async fn compact(&self, up_to: u64) -> Result<(), LogStoreError>;

    /// Drop all entries and continue the log at `next_position`.
    async fn reset(&self, next_position: u64) -> Result<(), LogStoreError>;
}

pub(crate) fn check_contiguous(next: u64, entries: &[StoredEntry]) -> Result<(), LogStoreError> {
    let mut expected = next;
    for entry in entries {
        if entry.position != expected {
            return Err(LogStoreError::NonContiguous {
                expected,
                actual: entry.position,
            });
        }
        expected += 1;
    }
    Ok(())
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub position: u64,
    /// Position of the record whose processing wrote this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_position: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub record: Record,
}

impl LogEntry {
    pub fn encode(&self) -> Result<Bytes, LogStoreError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(entry: &StoredEntry) -> Result<Self, LogStoreError> {
        serde_json::from_slice(&entry.data).map_err(|e| LogStoreError::Corrupt {
            position: entry.position,
            details: e.to_string(),
        })
    }
}

/// The record log of a partition.
#[derive(Clone)]
pub struct PartitionLog {
    store: Arc<dyn LogStore>,
}

impl PartitionLog {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Append `records` at the next positions and commit them.
    pub async fn append(
        &self,
        source_position: Option<u64>,
        records: Vec<Record>,
    ) -> Result<Vec<LogEntry>, LogStoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let bounds = self.store.bounds().await?;
        let timestamp = Utc::now();
        let entries: Vec<LogEntry> = records
            .into_iter()
            .zip(bounds.next..)
            .map(|(record, position)| LogEntry {
                position,
                source_position,
                timestamp,
                record,
            })
            .collect();

        let stored = entries
            .iter()
            .map(|entry| {
                Ok(StoredEntry {
                    position: entry.position,
                    data: entry.encode()?,
                })
            })
            .collect::<Result<Vec<_>, LogStoreError>>()?;
        self.store.append(&stored).await?;
        if let Some(last) = entries.last() {
            self.store.set_commit_position(last.position).await?;
        }
        Ok(entries)
    }

    pub async fn read(&self, from: u64, max_entries: usize) -> Result<Vec<LogEntry>, LogStoreError> {
        self.store
            .read(from, max_entries)
            .await?
            .iter()
            .map(LogEntry::decode)
            .collect()
    }

    pub async fn bounds(&self) -> Result<LogBounds, LogStoreError> {
        self.store.bounds().await
    }
}

/// Serialized content of a partition snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    /// Last log position whose effects are in `state`.
    pub position: u64,
    /// Last command position processed when the snapshot was taken.
    pub processed_position: u64,
    pub state: PartitionState,
}

impl PartitionSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::cancel_workflow_instance;

    #[test]
    fn test_bounds_last() {
        let empty = LogBounds {
            first: 5,
            next: 5,
            commit: 4,
        };
        assert!(empty.is_empty());
        assert_eq!(empty.last(), None);

        let bounds = LogBounds {
            first: 1,
            next: 4,
            commit: 3,
        };
        assert_eq!(bounds.last(), Some(3));
    }

    #[test]
    fn test_check_contiguous() {
        let entries = vec![
            StoredEntry {
                position: 3,
                data: Bytes::from_static(b"a"),
            },
            StoredEntry {
                position: 5,
                data: Bytes::from_static(b"b"),
            },
        ];
        assert!(check_contiguous(3, &entries[..1]).is_ok());
        assert!(matches!(
            check_contiguous(2, &entries),
            Err(LogStoreError::NonContiguous {
                expected: 2,
                actual: 3
            })
        ));
        assert!(matches!(
            check_contiguous(3, &entries),
            Err(LogStoreError::NonContiguous {
                expected: 4,
                actual: 5
            })
        ));
    }

    #[tokio::test]
    async fn test_partition_log_assigns_positions() {
        let log = PartitionLog::new(Arc::new(MemoryLogStore::new()));

        let written = log
            .append(None, vec![cancel_workflow_instance(1), cancel_workflow_instance(2)])
            .await
            .unwrap();
        assert_eq!(written.iter().map(|e| e.position).collect::<Vec<_>>(), vec![1, 2]);

        let followups = log
            .append(Some(1), vec![cancel_workflow_instance(3)])
            .await
            .unwrap();
        assert_eq!(followups[0].position, 3);
        assert_eq!(followups[0].source_position, Some(1));

        let bounds = log.bounds().await.unwrap();
        assert_eq!((bounds.first, bounds.next, bounds.commit), (1, 4, 3));

        let read = log.read(2, 10).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].record.key, 3);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_reported() {
        let store = Arc::new(MemoryLogStore::new());
        store
            .append(&[StoredEntry {
                position: 1,
                data: Bytes::from_static(b"not json"),
            }])
            .await
            .unwrap();
        let log = PartitionLog::new(store);

        let err = log.read(1, 1).await.unwrap_err();
        assert!(matches!(err, LogStoreError::Corrupt { position: 1, .. }));
    }
}
