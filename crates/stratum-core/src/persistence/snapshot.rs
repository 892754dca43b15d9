// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chunked, checksummed snapshots on disk.
//!
//! Layout of a partition's snapshot directory:
//!
//! ```text
//! snapshots/
//!   120/                 committed snapshot at log position 120
//!     MANIFEST           chunk names, sizes and checksums (JSON)
//!     chunk-000000
//!     chunk-000001
//!   pending-180/         snapshot being written or received
//! ```
//!
//! A snapshot only becomes visible once its pending directory is renamed,
//! which happens after every chunk passed verification.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use stratum_protocol::SnapshotChunk;

const MANIFEST: &str = "MANIFEST";
const PENDING_PREFIX: &str = "pending-";

/// Checksum of a snapshot chunk: the first 8 bytes of its SHA-256 digest.
pub fn checksum(content: &[u8]) -> u64 {
    let digest = Sha256::digest(content);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

fn chunk_name(index: usize) -> String {
    format!("chunk-{index:06}")
}

fn is_safe_chunk_name(name: &str) -> bool {
    !name.is_empty()
        && name != MANIFEST
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("no snapshot at position {0}")]
    NotFound(u64),

    #[error("snapshot {position} has {count} chunks, chunk {index} requested")]
    ChunkOutOfRange { position: u64, index: u32, count: u32 },

    #[error("checksum mismatch for chunk '{name}': expected {expected:#018x}, got {actual:#018x}")]
    ChecksumMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("chunk belongs to snapshot {actual}, expected {expected}")]
    PositionMismatch { expected: u64, actual: u64 },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("snapshot incomplete: {received} of {expected} chunks received")]
    Incomplete { received: u32, expected: u32 },
}

/// One chunk as listed in a snapshot manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub name: String,
    pub checksum: u64,
    pub size: u64,
}

/// Manifest of a committed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Log position the snapshot covers.
    pub position: u64,
    /// Chunks in name order.
    pub chunks: Vec<ChunkInfo>,
}

impl SnapshotMetadata {
    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }
}

/// The snapshot directory of one partition.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open (or create) a snapshot directory, discarding leftovers of
    /// interrupted writes.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(PENDING_PREFIX) {
                warn!(path = ?entry.path(), "Removing incomplete snapshot");
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_dir(&self, position: u64) -> PathBuf {
        self.dir.join(position.to_string())
    }

    /// Positions of all committed snapshots, ascending.
    pub async fn positions(&self) -> Result<Vec<u64>, SnapshotError> {
        let mut positions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(position) = entry.file_name().to_string_lossy().parse::<u64>() else {
                continue;
            };
            if tokio::fs::try_exists(entry.path().join(MANIFEST)).await? {
                positions.push(position);
            }
        }
        positions.sort_unstable();
        Ok(positions)
    }

    /// The most recent committed snapshot.
    pub async fn latest(&self) -> Result<Option<SnapshotMetadata>, SnapshotError> {
        match self.positions().await?.last() {
            Some(&position) => Ok(Some(self.metadata(position).await?)),
            None => Ok(None),
        }
    }

    pub async fn metadata(&self, position: u64) -> Result<SnapshotMetadata, SnapshotError> {
        let path = self.snapshot_dir(position).join(MANIFEST);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(position));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write `content` as a snapshot at `position`, split into chunks of at
    /// most `chunk_size` bytes.
    pub async fn persist(
        &self,
        position: u64,
        content: &[u8],
        chunk_size: usize,
    ) -> Result<SnapshotMetadata, SnapshotError> {
        let mut parts: Vec<&[u8]> = content.chunks(chunk_size.max(1)).collect();
        if parts.is_empty() {
            parts.push(&[]);
        }
        let total_count = parts.len() as u32;

        let mut pending = self.begin_receive(position).await?;
        for (index, part) in parts.into_iter().enumerate() {
            let chunk = SnapshotChunk {
                snapshot_position: position,
                total_count,
                checksum: checksum(part),
                name: chunk_name(index),
                content: Bytes::copy_from_slice(part),
            };
            if let Err(e) = pending.apply(&chunk).await {
                pending.abort().await;
                return Err(e);
            }
        }
        let metadata = pending.commit().await?;
        info!(position, chunks = total_count, bytes = content.len(), "Snapshot persisted");
        Ok(metadata)
    }

    /// Read one chunk of a committed snapshot, verifying its checksum.
    pub async fn read_chunk(&self, position: u64, index: u32) -> Result<SnapshotChunk, SnapshotError> {
        let metadata = self.metadata(position).await?;
        let info = metadata
            .chunks
            .get(index as usize)
            .ok_or(SnapshotError::ChunkOutOfRange {
                position,
                index,
                count: metadata.chunk_count(),
            })?;
        let content = self.read_verified(position, info).await?;
        Ok(SnapshotChunk {
            snapshot_position: position,
            total_count: metadata.chunk_count(),
            checksum: info.checksum,
            name: info.name.clone(),
            content: Bytes::from(content),
        })
    }

    /// Content of a committed snapshot: its chunks concatenated in name order.
    pub async fn load(&self, position: u64) -> Result<Vec<u8>, SnapshotError> {
        let metadata = self.metadata(position).await?;
        let mut content = Vec::with_capacity(metadata.chunks.iter().map(|c| c.size as usize).sum());
        for info in &metadata.chunks {
            content.extend_from_slice(&self.read_verified(position, info).await?);
        }
        Ok(content)
    }

    async fn read_verified(&self, position: u64, info: &ChunkInfo) -> Result<Vec<u8>, SnapshotError> {
        let content = tokio::fs::read(self.snapshot_dir(position).join(&info.name)).await?;
        let actual = checksum(&content);
        if actual != info.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                name: info.name.clone(),
                expected: info.checksum,
                actual,
            });
        }
        Ok(content)
    }

    /// Start writing the snapshot at `position` chunk by chunk.
    pub async fn begin_receive(&self, position: u64) -> Result<PendingSnapshot, SnapshotError> {
        let dir = self.dir.join(format!("{PENDING_PREFIX}{position}"));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(PendingSnapshot {
            position,
            dir,
            target: self.snapshot_dir(position),
            total_count: None,
            chunks: BTreeMap::new(),
        })
    }

    /// Delete committed snapshots older than `position`.
    pub async fn purge_older_than(&self, position: u64) -> Result<usize, SnapshotError> {
        let mut removed = 0;
        for older in self.positions().await?.into_iter().filter(|p| *p < position) {
            tokio::fs::remove_dir_all(self.snapshot_dir(older)).await?;
            debug!(position = older, "Removed old snapshot");
            removed += 1;
        }
        Ok(removed)
    }
}

/// A snapshot being assembled from chunks.
#[derive(Debug)]
pub struct PendingSnapshot {
    position: u64,
    dir: PathBuf,
    target: PathBuf,
    total_count: Option<u32>,
    chunks: BTreeMap<String, ChunkInfo>,
}

impl PendingSnapshot {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Verify a chunk and write it to the pending directory.
    pub async fn apply(&mut self, chunk: &SnapshotChunk) -> Result<(), SnapshotError> {
        if chunk.snapshot_position != self.position {
            return Err(SnapshotError::PositionMismatch {
                expected: self.position,
                actual: chunk.snapshot_position,
            });
        }
        if !is_safe_chunk_name(&chunk.name) {
            return Err(SnapshotError::InvalidChunk(format!(
                "unusable chunk name '{}'",
                chunk.name
            )));
        }
        if chunk.total_count == 0 {
            return Err(SnapshotError::InvalidChunk(
                "chunk declares an empty snapshot".to_string(),
            ));
        }
        match self.total_count {
            Some(count) if count != chunk.total_count => {
                return Err(SnapshotError::InvalidChunk(format!(
                    "chunk count changed from {count} to {}",
                    chunk.total_count
                )));
            }
            _ => self.total_count = Some(chunk.total_count),
        }

        let actual = checksum(&chunk.content);
        if actual != chunk.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                name: chunk.name.clone(),
                expected: chunk.checksum,
                actual,
            });
        }

        tokio::fs::write(self.dir.join(&chunk.name), &chunk.content).await?;
        self.chunks.insert(
            chunk.name.clone(),
            ChunkInfo {
                name: chunk.name.clone(),
                checksum: chunk.checksum,
                size: chunk.content.len() as u64,
            },
        );
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.total_count == Some(self.received())
    }

    /// Make the snapshot visible. Fails if chunks are missing.
    pub async fn commit(self) -> Result<SnapshotMetadata, SnapshotError> {
        if !self.is_complete() {
            let received = self.received();
            let expected = self.total_count.unwrap_or(0);
            self.abort().await;
            return Err(SnapshotError::Incomplete { received, expected });
        }

        let metadata = SnapshotMetadata {
            position: self.position,
            chunks: self.chunks.into_values().collect(),
        };
        tokio::fs::write(self.dir.join(MANIFEST), serde_json::to_vec(&metadata)?).await?;

        match tokio::fs::remove_dir_all(&self.target).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::rename(&self.dir, &self.target).await?;
        Ok(metadata)
    }

    /// Discard everything received so far.
    pub async fn abort(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = ?self.dir, error = %e, "Failed to remove pending snapshot");
        }
    }
}
