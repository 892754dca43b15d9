// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Receiving side of the subscription protocol.

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use stratum_protocol::{DecodeError, SubscriptionCommand};

use super::{Delivery, NodeId};
use crate::partition::PartitionRegistry;
use crate::record::{
    MessageSubscriptionIntent, MessageSubscriptionRecord, NO_KEY, Payload, Record, RecordValue,
    WorkflowInstanceSubscriptionIntent, WorkflowInstanceSubscriptionRecord,
};

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("malformed subscription message: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid correlation payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Turns incoming subscription messages into commands on the local leader
/// of their target partition.
pub struct SubscriptionMessageHandler {
    node_id: NodeId,
    registry: PartitionRegistry,
}

impl SubscriptionMessageHandler {
    pub fn new(node_id: NodeId, registry: PartitionRegistry) -> Self {
        Self { node_id, registry }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Handle one encoded message.
    ///
    /// Messages for a partition this node does not lead are dropped without
    /// a reply; the sender retries once it resolves the right leader.
    #[instrument(skip(self, message), fields(node_id = self.node_id, len = message.len()))]
    pub async fn handle(&self, message: Bytes) -> Result<Delivery, ReceiveError> {
        let mut buf = message;
        let command = SubscriptionCommand::decode(&mut buf)?;
        let partition_id = command.target_partition_id();

        let Some(partition) = self.registry.get(partition_id).await else {
            debug!(partition_id, "No such partition on this node, dropping message");
            return Ok(Delivery::Dropped);
        };
        if !partition.is_leader() {
            debug!(partition_id, "Not leader, dropping message");
            return Ok(Delivery::Dropped);
        }

        let record = subscription_command_record(command)?;
        match partition.append_command(record) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(e) => {
                warn!(partition_id, error = %e, "Partition rejected subscription command");
                Ok(Delivery::Dropped)
            }
        }
    }
}

/// Command record a subscription message becomes on its target partition.
pub fn subscription_command_record(command: SubscriptionCommand) -> Result<Record, serde_json::Error> {
    let record = match command {
        SubscriptionCommand::OpenMessageSubscription(m) => message_subscription_command(
            MessageSubscriptionIntent::Open,
            MessageSubscriptionRecord {
                workflow_instance_partition_id: m.address.workflow_instance_partition_id,
                workflow_instance_key: m.address.workflow_instance_key,
                activity_instance_key: m.address.activity_instance_key,
                message_name: m.message_name,
                correlation_key: m.correlation_key,
                message_key: NO_KEY,
                payload: Payload::empty(),
            },
        ),
        SubscriptionCommand::CorrelateMessageSubscription(m) => message_subscription_command(
            MessageSubscriptionIntent::Correlate,
            MessageSubscriptionRecord {
                workflow_instance_partition_id: m.address.workflow_instance_partition_id,
                workflow_instance_key: m.address.workflow_instance_key,
                activity_instance_key: m.address.activity_instance_key,
                message_name: m.message_name,
                correlation_key: String::new(),
                message_key: NO_KEY,
                payload: Payload::empty(),
            },
        ),
        SubscriptionCommand::CloseMessageSubscription(m) => message_subscription_command(
            MessageSubscriptionIntent::Close,
            MessageSubscriptionRecord {
                workflow_instance_partition_id: m.address.workflow_instance_partition_id,
                workflow_instance_key: m.address.workflow_instance_key,
                activity_instance_key: m.address.activity_instance_key,
                message_name: m.message_name,
                correlation_key: String::new(),
                message_key: NO_KEY,
                payload: Payload::empty(),
            },
        ),
        SubscriptionCommand::OpenWorkflowInstanceSubscription(m) => {
            workflow_instance_subscription_command(
                WorkflowInstanceSubscriptionIntent::Open,
                WorkflowInstanceSubscriptionRecord {
                    subscription_partition_id: m.address.subscription_partition_id,
                    workflow_instance_key: m.address.workflow_instance_key,
                    activity_instance_key: m.address.activity_instance_key,
                    message_name: m.message_name,
                    correlation_key: String::new(),
                    payload: Payload::empty(),
                },
            )
        }
        SubscriptionCommand::CorrelateWorkflowInstanceSubscription(m) => {
            workflow_instance_subscription_command(
                WorkflowInstanceSubscriptionIntent::Correlate,
                WorkflowInstanceSubscriptionRecord {
                    subscription_partition_id: m.address.subscription_partition_id,
                    workflow_instance_key: m.address.workflow_instance_key,
                    activity_instance_key: m.address.activity_instance_key,
                    message_name: m.message_name,
                    correlation_key: String::new(),
                    payload: Payload::from_slice(&m.payload)?,
                },
            )
        }
    };
    Ok(record)
}

fn message_subscription_command(
    intent: MessageSubscriptionIntent,
    value: MessageSubscriptionRecord,
) -> Record {
    Record::command(
        value.activity_instance_key,
        RecordValue::MessageSubscription { intent, value },
    )
}

fn workflow_instance_subscription_command(
    intent: WorkflowInstanceSubscriptionIntent,
    value: WorkflowInstanceSubscriptionRecord,
) -> Record {
    Record::command(
        value.activity_instance_key,
        RecordValue::WorkflowInstanceSubscription { intent, value },
    )
}
