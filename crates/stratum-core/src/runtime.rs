// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for a stratum node.
//!
//! [`NodeRuntime`] opens every partition of the node, wires them into the
//! cluster for message correlation and serves replication requests.
//!
//! # Example
//!
//! ```rust,ignore
//! use stratum_core::config::Config;
//! use stratum_core::runtime::NodeRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = NodeRuntime::builder()
//!         .config(Config::new("/var/lib/stratum"))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let partition = runtime.partition(1).await.expect("partition 1");
//!     // ... deploy processes, create instances ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::correlation::{LocalCluster, NodeId, SubscriptionCommandSender, SubscriptionMessageHandler};
use crate::partition::{Partition, PartitionHandle, PartitionOptions, PartitionRegistry};
use crate::persistence::{LogStore, PartitionLog, SnapshotStore, SqliteLogStore};
use crate::replication::{PartitionReplicationSource, ReplicationServer};

/// Builder for creating a [`NodeRuntime`].
#[derive(Default)]
pub struct NodeRuntimeBuilder {
    config: Option<Config>,
    cluster: Option<Arc<LocalCluster>>,
    in_memory: bool,
}

impl std::fmt::Debug for NodeRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntimeBuilder")
            .field("config", &self.config)
            .field("cluster", &self.cluster.as_ref().map(|_| "..."))
            .field("in_memory", &self.in_memory)
            .finish()
    }
}

impl NodeRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Join an existing in-process cluster instead of starting a new one.
    pub fn cluster(mut self, cluster: Arc<LocalCluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Keep partition logs in memory. Snapshots still go to the data dir.
    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<NodeRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        if config.partition_count == 0 {
            anyhow::bail!("partition_count must be at least 1");
        }

        Ok(NodeRuntimeConfig {
            config,
            cluster: self.cluster.unwrap_or_else(|| Arc::new(LocalCluster::new())),
            in_memory: self.in_memory,
        })
    }
}

/// Configuration for a [`NodeRuntime`].
pub struct NodeRuntimeConfig {
    config: Config,
    cluster: Arc<LocalCluster>,
    in_memory: bool,
}

impl std::fmt::Debug for NodeRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntimeConfig")
            .field("config", &self.config)
            .field("cluster", &"...")
            .field("in_memory", &self.in_memory)
            .finish()
    }
}

impl NodeRuntimeConfig {
    /// Open all partitions and start the replication server.
    pub async fn start(self) -> Result<NodeRuntime> {
        let Self {
            config,
            cluster,
            in_memory,
        } = self;
        let node_id = config.node_id;
        let partition_ids = config.partition_ids();

        cluster.set_partition_ids(partition_ids.iter().copied()).await;
        let sender = Arc::new(SubscriptionCommandSender::new(cluster.clone(), cluster.clone()));
        let registry = PartitionRegistry::new();
        let handler = Arc::new(SubscriptionMessageHandler::new(node_id, registry.clone()));
        let server = Arc::new(ReplicationServer::new().with_subscriptions(handler.clone()));

        for &partition_id in &partition_ids {
            let partition = open_partition(&config, partition_id, in_memory, sender.clone()).await?;
            server
                .register(
                    partition_id,
                    Arc::new(PartitionReplicationSource::new(&partition)),
                )
                .await;
            registry.register(partition).await;
        }

        cluster.register_node(handler).await;
        for &partition_id in &partition_ids {
            cluster.set_leader(partition_id, node_id).await;
        }
        sender.on_topology_changed().await;

        let listener = TcpListener::bind(config.replication_addr).await?;
        let replication_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .serve(listener, shutdown_rx)
                    .await
                    .map_err(anyhow::Error::from)
            }
        });

        let expiry_handle = config.message_expiry_interval.map(|interval| {
            tokio::spawn(expire_messages_every(
                interval,
                registry.clone(),
                shutdown_tx.subscribe(),
            ))
        });

        info!(
            node_id,
            partitions = partition_ids.len(),
            addr = %replication_addr,
            "NodeRuntime started"
        );

        Ok(NodeRuntime {
            node_id,
            server_handle,
            expiry_handle,
            shutdown_tx,
            registry,
            cluster,
            server,
            replication_addr,
        })
    }
}

async fn open_partition(
    config: &Config,
    partition_id: u16,
    in_memory: bool,
    sender: Arc<SubscriptionCommandSender>,
) -> Result<PartitionHandle> {
    let dir = config.partition_dir(partition_id);
    let store: Arc<dyn LogStore> = if in_memory {
        Arc::new(SqliteLogStore::in_memory().await?)
    } else {
        Arc::new(SqliteLogStore::from_path(dir.join("log.db")).await?)
    };
    let snapshots = SnapshotStore::open(dir.join("snapshots")).await?;

    let partition = Partition::open(
        PartitionOptions::from_config(config, partition_id),
        PartitionLog::new(store),
        snapshots,
        sender,
    )
    .await?;
    Ok(partition)
}

/// Queue an expire command on every partition this node leads.
async fn expire_messages(registry: &PartitionRegistry, now: i64) -> usize {
    let mut queued = 0;
    for partition in registry.all().await {
        if !partition.is_leader() {
            continue;
        }
        match partition.expire_messages(now) {
            Ok(()) => queued += 1,
            Err(e) => warn!(partition_id = partition.partition_id(), error = %e, "Message expiry not queued"),
        }
    }
    queued
}

async fn expire_messages_every(
    interval: Duration,
    registry: PartitionRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = chrono::Utc::now().timestamp_millis();
                let queued = expire_messages(&registry, now).await;
                debug!(queued, now, "Queued message expiry");
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// A running stratum node that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct NodeRuntime {
    node_id: NodeId,
    server_handle: JoinHandle<Result<()>>,
    expiry_handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    registry: PartitionRegistry,
    cluster: Arc<LocalCluster>,
    server: Arc<ReplicationServer>,
    replication_addr: SocketAddr,
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("node_id", &self.node_id)
            .field("replication_addr", &self.replication_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

impl NodeRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> NodeRuntimeBuilder {
        NodeRuntimeBuilder::new()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Address the replication server is bound to.
    pub fn replication_addr(&self) -> SocketAddr {
        self.replication_addr
    }

    pub async fn partition(&self, partition_id: u16) -> Option<PartitionHandle> {
        self.registry.get(partition_id).await
    }

    pub fn registry(&self) -> &PartitionRegistry {
        &self.registry
    }

    pub fn cluster(&self) -> &Arc<LocalCluster> {
        &self.cluster
    }

    pub fn replication_server(&self) -> &Arc<ReplicationServer> {
        &self.server
    }

    /// Retry undelivered subscription messages on every partition.
    /// Returns how many are still waiting.
    pub async fn retry_pending_sends(&self) -> usize {
        let mut pending = 0;
        for partition in self.registry.all().await {
            match partition.retry_pending_sends().await {
                Ok(count) => pending += count,
                Err(e) => warn!(partition_id = partition.partition_id(), error = %e, "Retry failed"),
            }
        }
        pending
    }

    /// Delete buffered messages whose deadline is at or before `now` (epoch
    /// milliseconds) on every partition this node leads. Returns how many
    /// partitions took the command.
    pub async fn expire_messages(&self, now: i64) -> usize {
        expire_messages(&self.registry, now).await
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting replication connections, then stops every partition
    /// once its queued commands are processed.
    pub async fn shutdown(self) -> Result<()> {
        info!(node_id = self.node_id, "NodeRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);
        if let Some(expiry) = self.expiry_handle
            && let Err(e) = expiry.await
        {
            warn!(error = %e, "Message expiry task failed");
        }

        for partition in self.registry.all().await {
            if let Err(e) = partition.shutdown().await {
                warn!(partition_id = partition.partition_id(), error = %e, "Partition was already stopped");
            }
            self.cluster.remove_leader(partition.partition_id()).await;
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("NodeRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Replication server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Replication server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn test_config(dir: &std::path::Path, partition_count: u16) -> Config {
        let mut config = Config::new(dir);
        config.partition_count = partition_count;
        config.replication_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        config
    }

    #[test]
    fn test_builder_requires_config() {
        let result = NodeRuntime::builder().build();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("config is required"));
    }

    #[test]
    fn test_builder_debug_hides_cluster() {
        let builder = NodeRuntime::builder().cluster(Arc::new(LocalCluster::new()));
        let debug = format!("{builder:?}");
        assert!(debug.contains("NodeRuntimeBuilder"));
        assert!(debug.contains("..."));
    }

    #[test]
    fn test_builder_rejects_zero_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let result = NodeRuntime::builder()
            .config(test_config(dir.path(), 0))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_opens_every_partition() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = NodeRuntime::builder()
            .config(test_config(dir.path(), 3))
            .in_memory(true)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        assert_eq!(runtime.registry().ids().await, vec![1, 2, 3]);
        assert_ne!(runtime.replication_addr().port(), 0);
        assert!(dir.path().join("partition-2").join("snapshots").is_dir());

        runtime.shutdown().await.unwrap();
    }

    async fn start_on_disk(dir: &std::path::Path) -> NodeRuntime {
        NodeRuntime::builder()
            .config(test_config(dir, 1))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_partitions_persist_across_restarts() {
        let dir = tempfile::tempdir().unwrap();

        let runtime = start_on_disk(dir.path()).await;
        let partition = runtime.partition(1).await.unwrap();
        partition.deploy(Vec::new()).await.unwrap();
        let commit = partition.positions().commit;
        assert!(commit >= 2);
        drop(partition);
        runtime.shutdown().await.unwrap();

        let runtime = start_on_disk(dir.path()).await;
        let partition = runtime.partition(1).await.unwrap();
        assert_eq!(partition.positions().commit, commit);
        runtime.shutdown().await.unwrap();
    }
}
