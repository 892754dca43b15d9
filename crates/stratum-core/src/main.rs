// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratum Node - runs every partition of one node.
//!
//! Partitions are opened from `STRATUM_DATA_DIR`, recovered from their
//! latest snapshot and log, and served to restoring replicas on the
//! replication port until the process receives Ctrl-C.

use anyhow::Result;
use tracing::{error, info};

use stratum_core::config::Config;
use stratum_core::runtime::NodeRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stratum_core=info")),
        )
        .init();

    info!("Starting Stratum node");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        node_id = config.node_id,
        data_dir = %config.data_dir.display(),
        partitions = config.partition_count,
        replication_addr = %config.replication_addr,
        "Configuration loaded"
    );

    let runtime = NodeRuntime::builder().config(config).build()?.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
