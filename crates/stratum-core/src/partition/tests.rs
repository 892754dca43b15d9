// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use super::*;
use stratum_protocol::{OpenMessageSubscription, SubscriptionAddress, SubscriptionCommand};

use crate::correlation::{Delivery, LocalCluster, SubscriptionMessageHandler};
use crate::error::RejectionType;
use crate::persistence::{LogStore, MemoryLogStore};
use crate::record::{
    FlowElement, Payload, ProcessDefinition, RecordType, WorkflowInstanceIntent, deploy,
};
use crate::state::SubscriptionStatus;

struct Fixture {
    store: Arc<MemoryLogStore>,
    dir: TempDir,
    cluster: Arc<LocalCluster>,
    sender: Arc<SubscriptionCommandSender>,
}

impl Fixture {
    async fn new() -> Self {
        let cluster = Arc::new(LocalCluster::new());
        cluster.set_partition_ids([1]).await;
        let sender = Arc::new(SubscriptionCommandSender::new(cluster.clone(), cluster.clone()));
        Self {
            store: Arc::new(MemoryLogStore::new()),
            dir: tempfile::tempdir().unwrap(),
            cluster,
            sender,
        }
    }

    fn log(&self) -> PartitionLog {
        PartitionLog::new(self.store.clone())
    }

    async fn open(&self) -> PartitionHandle {
        let snapshots = SnapshotStore::open(self.dir.path()).await.unwrap();
        Partition::open(
            PartitionOptions::new(1),
            self.log(),
            snapshots,
            self.sender.clone(),
        )
        .await
        .unwrap()
    }

    /// Route subscription messages for partition 1 back into `handle`.
    async fn loop_back(&self, handle: &PartitionHandle) {
        let registry = PartitionRegistry::new();
        registry.register(handle.clone()).await;
        self.cluster
            .register_node(Arc::new(SubscriptionMessageHandler::new(1, registry)))
            .await;
        self.cluster.set_leader(1, 1).await;
    }
}

fn payload(value: serde_json::Value) -> Payload {
    Payload::try_from(value).unwrap()
}

fn start_end(process_id: &str) -> ProcessDefinition {
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

fn wait_for_payment() -> ProcessDefinition {
    ProcessDefinition {
        process_id: "order".to_string(),
        elements: vec![
            FlowElement::StartEvent {
                id: "start".to_string(),
            },
            FlowElement::MessageCatch {
                id: "paid".to_string(),
                message_name: "order-paid".to_string(),
                correlation_key: "orderId".to_string(),
            },
            FlowElement::EndEvent {
                id: "end".to_string(),
            },
        ],
    }
}

async fn eventually(
    handle: &PartitionHandle,
    check: impl Fn(&PartitionState) -> bool,
) -> PartitionState {
    for _ in 0..200 {
        let state = handle.inspect_state().await.unwrap();
        if check(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("partition state never reached the expected shape");
}

#[tokio::test]
async fn test_execute_returns_response_after_processing() {
    let fixture = Fixture::new().await;
    let partition = fixture.open().await;
    partition.deploy(vec![start_end("ping")]).await.unwrap();

    let ready = partition
        .create_workflow_instance("ping", payload(json!({"a": 1})))
        .await
        .unwrap();

    let (intent, value) = ready.workflow_instance().unwrap();
    assert_eq!(intent, WorkflowInstanceIntent::ElementReady);
    assert_eq!(value.workflow_instance_key, ready.key);
    assert!(ready.request.is_some());

    let state = partition.inspect_state().await.unwrap();
    assert!(state.elements.is_empty());
    let positions = partition.positions();
    assert_eq!(positions.processed, positions.commit);
}

#[tokio::test]
async fn test_rejection_is_returned_to_caller() {
    let fixture = Fixture::new().await;
    let partition = fixture.open().await;

    let response = partition.cancel_workflow_instance(12345).await.unwrap();

    assert_eq!(response.record_type, RecordType::CommandRejection);
    assert_eq!(
        response.rejection.unwrap().rejection_type,
        RejectionType::NotApplicable
    );
}

#[tokio::test]
async fn test_reopen_rebuilds_identical_state() {
    let fixture = Fixture::new().await;
    let partition = fixture.open().await;
    partition.deploy(vec![wait_for_payment()]).await.unwrap();
    let first = partition
        .create_workflow_instance("order", payload(json!({"orderId": "o-1"})))
        .await
        .unwrap();
    let before = partition.inspect_state().await.unwrap();
    partition.shutdown().await.unwrap();

    let reopened = fixture.open().await;
    assert_eq!(reopened.inspect_state().await.unwrap(), before);

    let second = reopened
        .create_workflow_instance("order", payload(json!({"orderId": "o-2"})))
        .await
        .unwrap();
    assert!(second.key > first.key);
}

#[tokio::test]
async fn test_unprocessed_commands_are_processed_on_open() {
    let fixture = Fixture::new().await;
    fixture
        .log()
        .append(None, vec![deploy(vec![start_end("a"), start_end("b")])])
        .await
        .unwrap();

    let partition = fixture.open().await;

    let state = partition.inspect_state().await.unwrap();
    assert_eq!(state.processes.len(), 2);
    let positions = partition.positions();
    assert_eq!(positions.processed, positions.commit);
    assert_eq!(positions.commit, 2);
}

#[tokio::test]
async fn test_snapshot_then_compaction_waits_for_exporter() {
    let fixture = Fixture::new().await;
    let partition = fixture.open().await;
    partition.deploy(vec![wait_for_payment()]).await.unwrap();
    partition
        .create_workflow_instance("order", payload(json!({"orderId": "o-1"})))
        .await
        .unwrap();
    let before = partition.inspect_state().await.unwrap();

    let snapshot = partition.take_snapshot().await.unwrap().unwrap();
    let positions = partition.positions();
    assert_eq!(snapshot, positions.commit);
    assert_eq!(positions.snapshot, Some(snapshot));
    // nothing exported yet, so nothing may be compacted
    assert_eq!(positions.first, 1);

    partition.set_exporter_position(snapshot - 2).await.unwrap();
    assert_eq!(partition.positions().first, snapshot - 1);

    partition.set_exporter_position(snapshot).await.unwrap();
    let bounds = fixture.store.bounds().await.unwrap();
    assert!(bounds.is_empty());
    assert_eq!(bounds.first, snapshot + 1);

    // taking a snapshot again at the same position is a no-op
    assert_eq!(partition.take_snapshot().await.unwrap(), Some(snapshot));
    partition.shutdown().await.unwrap();

    let reopened = fixture.open().await;
    assert_eq!(reopened.inspect_state().await.unwrap(), before);
    assert_eq!(reopened.positions().snapshot, Some(snapshot));
}

#[tokio::test]
async fn test_empty_partition_has_no_snapshot() {
    let fixture = Fixture::new().await;
    let partition = fixture.open().await;

    assert_eq!(partition.take_snapshot().await.unwrap(), None);
}

#[tokio::test]
async fn test_pending_subscription_is_sent_on_retry() {
    let fixture = Fixture::new().await;
    let partition = fixture.open().await;
    partition.deploy(vec![wait_for_payment()]).await.unwrap();
    let root = partition
        .create_workflow_instance("order", payload(json!({"orderId": "o-1"})))
        .await
        .unwrap()
        .key;

    // no leader known for the subscription partition yet
    assert_eq!(partition.retry_pending_sends().await.unwrap(), 1);

    fixture.loop_back(&partition).await;
    assert_eq!(partition.retry_pending_sends().await.unwrap(), 0);

    let state = eventually(&partition, |state| {
        state
            .elements
            .children(root)
            .next()
            .and_then(|child| state.subscriptions.get(child.key, "order-paid"))
            .is_some_and(|s| s.status == SubscriptionStatus::Opened)
    })
    .await;
    assert_eq!(state.messages.subscription_len(), 1);

    partition
        .publish_message("order-paid", "o-1", "", 0, payload(json!({"paid": true})))
        .await
        .unwrap();
    let state = eventually(&partition, |state| {
        state.elements.get(root).is_none() && state.messages.subscription_len() == 0
    })
    .await;
    assert!(state.subscriptions.is_empty());
}

#[tokio::test]
async fn test_shutdown_drains_queued_commands() {
    let fixture = Fixture::new().await;
    let partition = fixture.open().await;

    for process_id in ["a", "b", "c"] {
        partition
            .append_command(deploy(vec![start_end(process_id)]))
            .unwrap();
    }
    partition.shutdown().await.unwrap();

    assert!(matches!(
        partition.append_command(deploy(vec![start_end("d")])),
        Err(PartitionError::Closed(1))
    ));
    assert!(matches!(
        partition.inspect_state().await,
        Err(PartitionError::Closed(1))
    ));

    let reopened = fixture.open().await;
    assert_eq!(reopened.inspect_state().await.unwrap().processes.len(), 3);
}

#[tokio::test]
async fn test_unconfirmed_subscription_is_resent_after_reopen() {
    let fixture = Fixture::new().await;
    let partition = fixture.open().await;
    partition.deploy(vec![wait_for_payment()]).await.unwrap();
    let root = partition
        .create_workflow_instance("order", payload(json!({"orderId": "o-1"})))
        .await
        .unwrap()
        .key;
    assert_eq!(partition.retry_pending_sends().await.unwrap(), 1);
    partition.shutdown().await.unwrap();

    let reopened = fixture.open().await;
    // rebuilt from the Opening subscription, still no leader to send to
    assert_eq!(reopened.retry_pending_sends().await.unwrap(), 1);

    fixture.loop_back(&reopened).await;
    assert_eq!(reopened.retry_pending_sends().await.unwrap(), 0);
    let state = eventually(&reopened, |state| {
        state
            .elements
            .children(root)
            .next()
            .and_then(|child| state.subscriptions.get(child.key, "order-paid"))
            .is_some_and(|s| s.status == SubscriptionStatus::Opened)
    })
    .await;
    assert_eq!(state.messages.subscription_len(), 1);
}

#[tokio::test]
async fn test_follower_drops_subscription_messages() {
    let fixture = Fixture::new().await;
    let partition = fixture.open().await;
    let registry = PartitionRegistry::new();
    registry.register(partition.clone()).await;
    let handler = SubscriptionMessageHandler::new(1, registry);
    let message = SubscriptionCommand::from(OpenMessageSubscription {
        address: SubscriptionAddress {
            subscription_partition_id: 1,
            workflow_instance_partition_id: 1,
            workflow_instance_key: 10,
            activity_instance_key: 11,
        },
        message_name: "order-paid".to_string(),
        correlation_key: "o-1".to_string(),
    })
    .to_bytes()
    .unwrap();

    partition.set_leader(false);
    assert_eq!(handler.handle(message.clone()).await.unwrap(), Delivery::Dropped);
    let state = partition.inspect_state().await.unwrap();
    assert_eq!(state.messages.subscription_len(), 0);
    assert_eq!(partition.positions().commit, 0);

    partition.set_leader(true);
    assert_eq!(handler.handle(message).await.unwrap(), Delivery::Delivered);
    eventually(&partition, |state| state.messages.subscription_len() == 1).await;
}
