// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory log storage for tests and embedded use.

use std::collections::VecDeque;

use tokio::sync::RwLock;

use super::{LogBounds, LogStore, LogStoreError, StoredEntry, check_contiguous};

struct MemoryLog {
    first: u64,
    commit: u64,
    entries: VecDeque<StoredEntry>,
}

impl MemoryLog {
    fn next(&self) -> u64 {
        self.first + self.entries.len() as u64
    }
}

/// Log store keeping every entry in memory.
pub struct MemoryLogStore {
    log: RwLock<MemoryLog>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            log: RwLock::new(MemoryLog {
                first: 1,
                commit: 0,
                entries: VecDeque::new(),
            }),
        }
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entries: &[StoredEntry]) -> Result<(), LogStoreError> {
        let mut log = self.log.write().await;
        check_contiguous(log.next(), entries)?;
        log.entries.extend(entries.iter().cloned());
        Ok(())
    }

    async fn read(&self, from: u64, max_entries: usize) -> Result<Vec<StoredEntry>, LogStoreError> {
        let log = self.log.read().await;
        let skip = from.saturating_sub(log.first) as usize;
        Ok(log.entries.iter().skip(skip).take(max_entries).cloned().collect())
    }

    async fn bounds(&self) -> Result<LogBounds, LogStoreError> {
        let log = self.log.read().await;
        Ok(LogBounds {
            first: log.first,
            next: log.next(),
            commit: log.commit,
        })
    }

    async fn set_commit_position(&self, position: u64) -> Result<(), LogStoreError> {
        let mut log = self.log.write().await;
        let next = log.next();
        if position >= next {
            return Err(LogStoreError::OutOfRange {
                position,
                first: log.first,
                next,
            });
        }
        log.commit = position;
        Ok(())
    }

    async fn compact(&self, up_to: u64) -> Result<(), LogStoreError> {
        let mut log = self.log.write().await;
        while log
            .entries
            .front()
            .is_some_and(|entry| entry.position <= up_to)
        {
            log.entries.pop_front();
            log.first += 1;
        }
        Ok(())
    }

    async fn reset(&self, next_position: u64) -> Result<(), LogStoreError> {
        let next_position = next_position.max(1);
        let mut log = self.log.write().await;
        log.entries.clear();
        log.first = next_position;
        log.commit = next_position - 1;
        Ok(())
    }
}
