// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Stratum node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding one subdirectory per partition
    pub data_dir: PathBuf,
    /// Identifier of this node in the cluster
    pub node_id: u32,
    /// Number of partitions, ids are `1..=partition_count`
    pub partition_count: u16,
    /// Largest accepted payload document, in bytes
    pub max_payload_size: usize,
    /// Log entries per replication block
    pub log_block_size: u32,
    /// Size of a snapshot chunk, in bytes
    pub snapshot_chunk_size: usize,
    /// Address the replication server listens on
    pub replication_addr: SocketAddr,
    /// How often buffered messages are checked for expiry, `None` to disable
    pub message_expiry_interval: Option<Duration>,
}

impl Config {
    pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;
    pub const DEFAULT_LOG_BLOCK_SIZE: u32 = 64;
    pub const DEFAULT_SNAPSHOT_CHUNK_SIZE: usize = 64 * 1024;
    pub const DEFAULT_REPLICATION_PORT: u16 = 8101;
    pub const DEFAULT_MESSAGE_EXPIRY_INTERVAL: Duration = Duration::from_secs(10);

    /// Configuration with defaults for everything but the data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            node_id: 0,
            partition_count: 1,
            max_payload_size: Self::DEFAULT_MAX_PAYLOAD_SIZE,
            log_block_size: Self::DEFAULT_LOG_BLOCK_SIZE,
            snapshot_chunk_size: Self::DEFAULT_SNAPSHOT_CHUNK_SIZE,
            replication_addr: SocketAddr::from(([0, 0, 0, 0], Self::DEFAULT_REPLICATION_PORT)),
            message_expiry_interval: Some(Self::DEFAULT_MESSAGE_EXPIRY_INTERVAL),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STRATUM_DATA_DIR`: root directory for partition logs and snapshots
    ///
    /// Optional (with defaults):
    /// - `STRATUM_NODE_ID`: node identifier (default: 0)
    /// - `STRATUM_PARTITION_COUNT`: number of partitions (default: 1)
    /// - `STRATUM_MAX_PAYLOAD_SIZE`: max payload bytes (default: 65536)
    /// - `STRATUM_LOG_BLOCK_SIZE`: entries per replication block (default: 64)
    /// - `STRATUM_SNAPSHOT_CHUNK_SIZE`: snapshot chunk bytes (default: 65536)
    /// - `STRATUM_REPLICATION_PORT`: replication server port (default: 8101)
    /// - `STRATUM_MESSAGE_EXPIRY_INTERVAL_MS`: message expiry check interval,
    ///   0 disables it (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("STRATUM_DATA_DIR")
            .map_err(|_| ConfigError::Missing("STRATUM_DATA_DIR"))?;

        let node_id: u32 = parse_var("STRATUM_NODE_ID", "0", "must be a non-negative integer")?;

        let partition_count: u16 = parse_var(
            "STRATUM_PARTITION_COUNT",
            "1",
            "must be an integer between 1 and 65534",
        )?;
        if partition_count == 0 || partition_count == u16::MAX {
            return Err(ConfigError::Invalid(
                "STRATUM_PARTITION_COUNT",
                "must be an integer between 1 and 65534",
            ));
        }

        let max_payload_size: usize = parse_var(
            "STRATUM_MAX_PAYLOAD_SIZE",
            "65536",
            "must be a positive integer",
        )?;

        let log_block_size: u32 =
            parse_var("STRATUM_LOG_BLOCK_SIZE", "64", "must be a positive integer")?;
        if log_block_size == 0 {
            return Err(ConfigError::Invalid(
                "STRATUM_LOG_BLOCK_SIZE",
                "must be a positive integer",
            ));
        }

        let snapshot_chunk_size: usize = parse_var(
            "STRATUM_SNAPSHOT_CHUNK_SIZE",
            "65536",
            "must be a positive integer",
        )?;
        if snapshot_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "STRATUM_SNAPSHOT_CHUNK_SIZE",
                "must be a positive integer",
            ));
        }

        let replication_port: u16 = parse_var(
            "STRATUM_REPLICATION_PORT",
            "8101",
            "must be a valid port number",
        )?;

        let expiry_ms: u64 = parse_var(
            "STRATUM_MESSAGE_EXPIRY_INTERVAL_MS",
            "10000",
            "must be a non-negative integer",
        )?;
        let message_expiry_interval = (expiry_ms > 0).then(|| Duration::from_millis(expiry_ms));

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            node_id,
            partition_count,
            max_payload_size,
            log_block_size,
            snapshot_chunk_size,
            replication_addr: SocketAddr::from(([0, 0, 0, 0], replication_port)),
            message_expiry_interval,
        })
    }

    /// Partition ids served by the cluster.
    pub fn partition_ids(&self) -> Vec<u16> {
        (1..=self.partition_count).collect()
    }

    /// Directory holding the log and snapshots of one partition.
    pub fn partition_dir(&self, partition_id: u16) -> PathBuf {
        self.data_dir.join(format!("partition-{partition_id}"))
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, message))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
