// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sending side of the subscription protocol.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use stratum_protocol::{
    CloseMessageSubscription, CorrelateMessageSubscription, CorrelateWorkflowInstanceSubscription,
    NULL_PARTITION_ID, OpenMessageSubscription, OpenWorkflowInstanceSubscription,
    SubscriptionAddress,
};

use super::{
    ClusterTransport, Delivery, SendError, SubscriptionRequest, TopologyProvider,
    TransportError, subscription_partition_id,
};

/// Sends subscription messages to the leader of their target partition.
///
/// Partition ids are fetched from the [`TopologyProvider`] the first time a
/// message needs them and cached until [`on_topology_changed`] is called.
/// No retries happen here: a [`Delivery::Pending`] result or an error is
/// handed back so the caller can retry on its own schedule.
///
/// [`on_topology_changed`]: SubscriptionCommandSender::on_topology_changed
pub struct SubscriptionCommandSender {
    transport: Arc<dyn ClusterTransport>,
    topology: Arc<dyn TopologyProvider>,
    partition_ids: RwLock<Option<Vec<u16>>>,
}

impl SubscriptionCommandSender {
    pub fn new(transport: Arc<dyn ClusterTransport>, topology: Arc<dyn TopologyProvider>) -> Self {
        Self {
            transport,
            topology,
            partition_ids: RwLock::new(None),
        }
    }

    /// Fetch the partition ids and cache them.
    pub async fn fetch_partition_ids(&self) -> Result<Vec<u16>, TransportError> {
        let mut ids = self.topology.partition_ids().await?;
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Err(TransportError::Topology(
                "cluster reported no partitions".to_string(),
            ));
        }
        *self.partition_ids.write().await = Some(ids.clone());
        debug!(partition_count = ids.len(), "Fetched partition ids");
        Ok(ids)
    }

    /// Forget the cached partition ids; the next send fetches them again.
    pub async fn on_topology_changed(&self) {
        *self.partition_ids.write().await = None;
    }

    async fn known_partition_ids(&self) -> Option<Vec<u16>> {
        if let Some(ids) = self.partition_ids.read().await.as_ref() {
            return Some(ids.clone());
        }
        match self.fetch_partition_ids().await {
            Ok(ids) => Some(ids),
            Err(e) => {
                warn!(error = %e, "Partition ids not available yet");
                None
            }
        }
    }

    /// Send one message. Resolves a missing subscription partition id from
    /// the request's correlation key first.
    #[instrument(skip(self, request), fields(template_id = request.command.template_id(), message_name = %request.command.message_name()))]
    pub async fn send(&self, request: &SubscriptionRequest) -> Result<Delivery, SendError> {
        let mut command = request.command.clone();

        if request.needs_subscription_partition() {
            let Some(correlation_key) = request.correlation_key.as_deref() else {
                return Err(SendError::Unroutable(command.message_name().to_string()));
            };
            let Some(ids) = self.known_partition_ids().await else {
                return Ok(Delivery::Pending);
            };
            let Some(partition_id) = subscription_partition_id(correlation_key, &ids) else {
                return Ok(Delivery::Pending);
            };
            command.address_mut().subscription_partition_id = partition_id;
        }

        let target = command.target_partition_id();
        let Some(leader) = self.transport.leader_of(target).await else {
            debug!(partition_id = target, "Leader unknown, message pending");
            return Ok(Delivery::Pending);
        };

        let message: Bytes = command.to_bytes()?;
        self.transport.send(leader, message).await?;
        debug!(partition_id = target, node_id = leader, "Subscription message sent");
        Ok(Delivery::Delivered)
    }

    pub async fn open_message_subscription(
        &self,
        workflow_instance_partition_id: u16,
        workflow_instance_key: i64,
        activity_instance_key: i64,
        message_name: &str,
        correlation_key: &str,
    ) -> Result<Delivery, SendError> {
        let request = SubscriptionRequest::new(OpenMessageSubscription {
            address: SubscriptionAddress {
                subscription_partition_id: NULL_PARTITION_ID,
                workflow_instance_partition_id,
                workflow_instance_key,
                activity_instance_key,
            },
            message_name: message_name.to_string(),
            correlation_key: correlation_key.to_string(),
        })
        .hashed_by(correlation_key);
        self.send(&request).await
    }

    pub async fn open_workflow_instance_subscription(
        &self,
        address: SubscriptionAddress,
        message_name: &str,
    ) -> Result<Delivery, SendError> {
        let request = SubscriptionRequest::new(OpenWorkflowInstanceSubscription {
            address,
            message_name: message_name.to_string(),
        });
        self.send(&request).await
    }

    pub async fn correlate_workflow_instance_subscription(
        &self,
        address: SubscriptionAddress,
        message_name: &str,
        payload: Bytes,
    ) -> Result<Delivery, SendError> {
        let request = SubscriptionRequest::new(CorrelateWorkflowInstanceSubscription {
            address,
            message_name: message_name.to_string(),
            payload,
        });
        self.send(&request).await
    }

    pub async fn correlate_message_subscription(
        &self,
        address: SubscriptionAddress,
        message_name: &str,
    ) -> Result<Delivery, SendError> {
        let request = SubscriptionRequest::new(CorrelateMessageSubscription {
            address,
            message_name: message_name.to_string(),
        });
        self.send(&request).await
    }

    pub async fn close_message_subscription(
        &self,
        address: SubscriptionAddress,
        message_name: &str,
        correlation_key: &str,
    ) -> Result<Delivery, SendError> {
        let request = SubscriptionRequest::new(CloseMessageSubscription {
            address,
            message_name: message_name.to_string(),
        })
        .hashed_by(correlation_key);
        self.send(&request).await
    }
}
