// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratum-core integration tests.
//!
//! Provides TestNode for running a node on a temporary data directory and
//! helpers for building process definitions and payloads.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use stratum_core::config::Config;
use stratum_core::correlation::LocalCluster;
use stratum_core::partition::PartitionHandle;
use stratum_core::record::{FlowElement, Payload, ProcessDefinition};
use stratum_core::runtime::NodeRuntime;
use stratum_core::state::{PartitionState, SubscriptionStatus};

/// A running node backed by a temporary directory.
pub struct TestNode {
    pub runtime: NodeRuntime,
    pub dir: TempDir,
}

impl TestNode {
    /// Start a node owning `partition_count` partitions.
    pub async fn start(partition_count: u16) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let runtime = start_runtime(dir.path(), partition_count, None).await;
        Self { runtime, dir }
    }

    /// Stop the node and start it again on the same data directory.
    pub async fn restart(self) -> Self {
        let Self { runtime, dir } = self;
        let partition_count = runtime.registry().ids().await.len() as u16;
        runtime.shutdown().await.expect("Failed to shut down node");
        let runtime = start_runtime(dir.path(), partition_count, None).await;
        Self { runtime, dir }
    }

    pub async fn partition(&self, partition_id: u16) -> PartitionHandle {
        self.runtime
            .partition(partition_id)
            .await
            .unwrap_or_else(|| panic!("partition {partition_id} is not running"))
    }

    /// Deploy on every partition, the way a deployment is distributed.
    pub async fn deploy(&self, definitions: Vec<ProcessDefinition>) {
        for partition in self.runtime.registry().all().await {
            partition
                .deploy(definitions.clone())
                .await
                .expect("Failed to deploy");
        }
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await.expect("Failed to shut down node");
    }
}

pub async fn start_runtime(
    dir: &Path,
    partition_count: u16,
    cluster: Option<Arc<LocalCluster>>,
) -> NodeRuntime {
    let mut config = Config::new(dir);
    config.partition_count = partition_count;
    config.snapshot_chunk_size = 512;
    config.replication_addr = SocketAddr::from(([127, 0, 0, 1], 0));

    let mut builder = NodeRuntime::builder().config(config);
    if let Some(cluster) = cluster {
        builder = builder.cluster(cluster);
    }
    builder
        .build()
        .expect("Failed to build runtime")
        .start()
        .await
        .expect("Failed to start runtime")
}

pub fn payload(value: Value) -> Payload {
    Payload::try_from(value).expect("payload must be a JSON object")
}

pub fn start_end(process_id: &str) -> ProcessDefinition {
    ProcessDefinition {
        process_id: process_id.to_string(),
        elements: vec![
            FlowElement::StartEvent {
                id: "start".to_string(),
            },
            FlowElement::EndEvent {
                id: "end".to_string(),
            },
        ],
    }
}

/// start -> wait for `message_name` correlated by `correlation_key` -> end
pub fn wait_for_message(process_id: &str, message_name: &str, correlation_key: &str) -> ProcessDefinition {
    ProcessDefinition {
        process_id: process_id.to_string(),
        elements: vec![
            FlowElement::StartEvent {
                id: "start".to_string(),
            },
            FlowElement::MessageCatch {
                id: "catch".to_string(),
                message_name: message_name.to_string(),
                correlation_key: correlation_key.to_string(),
            },
            FlowElement::EndEvent {
                id: "end".to_string(),
            },
        ],
    }
}

/// Wait until the catch event of every instance in `roots` has an opened
/// subscription for `message_name`.
pub async fn wait_until_subscribed(
    partition: &PartitionHandle,
    roots: &[i64],
    message_name: &str,
) -> PartitionState {
    eventually(partition, |state| {
        roots.iter().all(|&root| {
            state
                .elements
                .children(root)
                .next()
                .and_then(|child| state.subscriptions.get(child.key, message_name))
                .is_some_and(|s| s.status == SubscriptionStatus::Opened)
        })
    })
    .await
}

/// Poll the partition state until `check` holds.
pub async fn eventually(
    partition: &PartitionHandle,
    check: impl Fn(&PartitionState) -> bool,
) -> PartitionState {
    for _ in 0..300 {
        let state = partition
            .inspect_state()
            .await
            .expect("partition stopped");
        if check(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "partition {} never reached the expected state",
        partition.partition_id()
    );
}
