// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subscription commands received by the workflow instance partition.
//!
//! Both handlers are idempotent: a repeated or late message produces no
//! events, at most a repeated acknowledgement.

use tracing::debug;

use stratum_protocol::{CorrelateMessageSubscription, SubscriptionAddress};

use super::ResultBuilder;
use crate::correlation::SubscriptionRequest;
use crate::error::Result;
use crate::record::{
    RecordValue, WorkflowInstanceIntent, WorkflowInstanceRecord,
    WorkflowInstanceSubscriptionIntent, WorkflowInstanceSubscriptionRecord,
};
use crate::state::SubscriptionStatus;

/// The message partition confirmed the subscription.
pub(super) fn open(b: &mut ResultBuilder<'_>, value: &WorkflowInstanceSubscriptionRecord) -> Result<()> {
    let Some(subscription) = b
        .state()
        .subscriptions
        .get(value.activity_instance_key, &value.message_name)
        .cloned()
    else {
        debug!(key = value.activity_instance_key, "Confirmation for unknown subscription");
        return Ok(());
    };
    if subscription.status != SubscriptionStatus::Opening {
        return Ok(());
    }

    b.event(
        value.activity_instance_key,
        RecordValue::WorkflowInstanceSubscription {
            intent: WorkflowInstanceSubscriptionIntent::Opened,
            value: WorkflowInstanceSubscriptionRecord {
                subscription_partition_id: value.subscription_partition_id,
                ..subscription.record
            },
        },
    );
    Ok(())
}

/// A message was correlated to the subscription: complete the waiting
/// element with the message payload and acknowledge.
pub(super) fn correlate(b: &mut ResultBuilder<'_>, value: &WorkflowInstanceSubscriptionRecord) -> Result<()> {
    let key = value.activity_instance_key;
    let acknowledgement = SubscriptionRequest::new(CorrelateMessageSubscription {
        address: SubscriptionAddress {
            subscription_partition_id: value.subscription_partition_id,
            workflow_instance_partition_id: b.partition_id(),
            workflow_instance_key: value.workflow_instance_key,
            activity_instance_key: key,
        },
        message_name: value.message_name.clone(),
    });
    let Some(subscription) = b
        .state()
        .subscriptions
        .get(key, &value.message_name)
        .cloned()
    else {
        // the message partition keeps the subscription until acknowledged
        debug!(key, "Correlation for unknown or closed subscription");
        b.side_effect(acknowledgement);
        return Ok(());
    };

    if subscription.status == SubscriptionStatus::Correlated {
        b.side_effect(acknowledgement);
        return Ok(());
    }
    if !subscription.is_correlatable() {
        return Ok(());
    }
    let Some(element) = b
        .state()
        .elements
        .get(key)
        .filter(|element| element.is_active())
        .cloned()
    else {
        debug!(key, "Element no longer waiting for a message");
        return Ok(());
    };

    b.event(
        key,
        RecordValue::WorkflowInstanceSubscription {
            intent: WorkflowInstanceSubscriptionIntent::Correlated,
            value: WorkflowInstanceSubscriptionRecord {
                subscription_partition_id: value.subscription_partition_id,
                payload: value.payload.clone(),
                ..subscription.record
            },
        },
    );
    let mut payload = element.record.payload.clone();
    payload.merge(&value.payload);
    b.event(
        key,
        RecordValue::WorkflowInstance {
            intent: WorkflowInstanceIntent::ElementCompleting,
            value: WorkflowInstanceRecord {
                payload,
                ..element.record
            },
        },
    );
    b.side_effect(acknowledgement);
    Ok(())
}
