// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed log storage.

use std::path::Path;

use bytes::Bytes;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::{LogBounds, LogStore, LogStoreError, StoredEntry, check_contiguous};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed partition log.
#[derive(Clone)]
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    /// Create a log store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the log database at `path`, creating it if needed.
    ///
    /// Parent directories are created and migrations run before the store is
    /// returned.
    ///
    /// ```ignore
    /// let store = SqliteLogStore::from_path(".data/partition-1/log.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, LogStoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory log database.
    pub async fn in_memory() -> Result<Self, LogStoreError> {
        // a single connection keeps the in-memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

async fn read_bounds(tx: &mut Transaction<'_, Sqlite>) -> Result<LogBounds, LogStoreError> {
    let (first, next, commit): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT first_position, next_position, commit_position
        FROM log_meta
        WHERE id = 1
        "#,
    )
    .fetch_one(&mut **tx)
    .await?;

    Ok(LogBounds {
        first: first as u64,
        next: next as u64,
        commit: commit as u64,
    })
}

#[async_trait::async_trait]
impl LogStore for SqliteLogStore {
    async fn append(&self, entries: &[StoredEntry]) -> Result<(), LogStoreError> {
        let Some(last) = entries.last() else {
            return Ok(());
        };
        let mut tx = self.pool.begin().await?;
        let bounds = read_bounds(&mut tx).await?;
        check_contiguous(bounds.next, entries)?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO log_entries (position, data)
                VALUES (?, ?)
                "#,
            )
            .bind(entry.position as i64)
            .bind(entry.data.as_ref())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE log_meta
            SET next_position = ?
            WHERE id = 1
            "#,
        )
        .bind((last.position + 1) as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn read(&self, from: u64, max_entries: usize) -> Result<Vec<StoredEntry>, LogStoreError> {
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT position, data
            FROM log_entries
            WHERE position >= ?
            ORDER BY position ASC
            LIMIT ?
            "#,
        )
        .bind(from.min(i64::MAX as u64) as i64)
        .bind(max_entries.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(position, data)| StoredEntry {
                position: position as u64,
                data: Bytes::from(data),
            })
            .collect())
    }

    async fn bounds(&self) -> Result<LogBounds, LogStoreError> {
        let mut tx = self.pool.begin().await?;
        let bounds = read_bounds(&mut tx).await?;
        tx.commit().await?;
        Ok(bounds)
    }

    async fn set_commit_position(&self, position: u64) -> Result<(), LogStoreError> {
        let mut tx = self.pool.begin().await?;
        let bounds = read_bounds(&mut tx).await?;
        if position >= bounds.next {
            return Err(LogStoreError::OutOfRange {
                position,
                first: bounds.first,
                next: bounds.next,
            });
        }

        sqlx::query(
            r#"
            UPDATE log_meta
            SET commit_position = ?
            WHERE id = 1
            "#,
        )
        .bind(position as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn compact(&self, up_to: u64) -> Result<(), LogStoreError> {
        let mut tx = self.pool.begin().await?;
        let bounds = read_bounds(&mut tx).await?;
        let first = (up_to.saturating_add(1)).min(bounds.next).max(bounds.first);
        if first == bounds.first {
            return Ok(());
        }

        sqlx::query(
            r#"
            DELETE FROM log_entries
            WHERE position < ?
            "#,
        )
        .bind(first as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE log_meta
            SET first_position = ?
            WHERE id = 1
            "#,
        )
        .bind(first as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reset(&self, next_position: u64) -> Result<(), LogStoreError> {
        let next_position = next_position.max(1);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM log_entries")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE log_meta
            SET first_position = ?, next_position = ?, commit_position = ?
            WHERE id = 1
            "#,
        )
        .bind(next_position as i64)
        .bind(next_position as i64)
        .bind((next_position - 1) as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<StoredEntry> {
        range
            .map(|position| StoredEntry {
                position,
                data: Bytes::from(format!("entry-{position}")),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_log_bounds() {
        let store = SqliteLogStore::new(test_pool().await);

        let bounds = store.bounds().await.unwrap();
        assert_eq!(
            bounds,
            LogBounds {
                first: 1,
                next: 1,
                commit: 0
            }
        );
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let store = SqliteLogStore::new(test_pool().await);

        store.append(&entries(1..=5)).await.unwrap();
        store.set_commit_position(5).await.unwrap();

        let read = store.read(2, 2).await.unwrap();
        assert_eq!(read, entries(2..=3));

        let bounds = store.bounds().await.unwrap();
        assert_eq!((bounds.first, bounds.next, bounds.commit), (1, 6, 5));
    }

    #[tokio::test]
    async fn test_append_rejects_gap() {
        let store = SqliteLogStore::new(test_pool().await);
        store.append(&entries(1..=2)).await.unwrap();

        let err = store.append(&entries(4..=4)).await.unwrap_err();
        assert!(matches!(
            err,
            LogStoreError::NonContiguous {
                expected: 3,
                actual: 4
            }
        ));
        assert_eq!(store.bounds().await.unwrap().next, 3);
    }

    #[tokio::test]
    async fn test_commit_beyond_end_rejected() {
        let store = SqliteLogStore::new(test_pool().await);
        store.append(&entries(1..=2)).await.unwrap();

        assert!(matches!(
            store.set_commit_position(3).await,
            Err(LogStoreError::OutOfRange { position: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_compact_keeps_tail() {
        let store = SqliteLogStore::new(test_pool().await);
        store.append(&entries(1..=6)).await.unwrap();

        store.compact(3).await.unwrap();

        let bounds = store.bounds().await.unwrap();
        assert_eq!((bounds.first, bounds.next), (4, 7));
        let read = store.read(1, 10).await.unwrap();
        assert_eq!(read.first().map(|e| e.position), Some(4));
        assert_eq!(read.len(), 3);

        // compacting past the end leaves an empty log that continues at 7
        store.compact(100).await.unwrap();
        let bounds = store.bounds().await.unwrap();
        assert!(bounds.is_empty());
        assert_eq!(bounds.next, 7);
    }

    #[tokio::test]
    async fn test_reset_continues_at_position() {
        let store = SqliteLogStore::new(test_pool().await);
        store.append(&entries(1..=3)).await.unwrap();

        store.reset(11).await.unwrap();

        let bounds = store.bounds().await.unwrap();
        assert_eq!(
            bounds,
            LogBounds {
                first: 11,
                next: 11,
                commit: 10
            }
        );
        assert!(store.read(1, 10).await.unwrap().is_empty());
        store.append(&entries(11..=12)).await.unwrap();
        assert_eq!(store.bounds().await.unwrap().next, 13);
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("log.db");

        let store = SqliteLogStore::from_path(&path).await.unwrap();
        store.append(&entries(1..=1)).await.unwrap();
        drop(store);

        let reopened = SqliteLogStore::from_path(&path).await.unwrap();
        assert_eq!(reopened.bounds().await.unwrap().next, 2);
    }
}
