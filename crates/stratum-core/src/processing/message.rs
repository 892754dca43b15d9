// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message publication and the subscription commands received by the
//! partition a correlation key hashes to.

use std::collections::BTreeSet;

use bytes::Bytes;
use tracing::debug;

use stratum_protocol::{
    CorrelateWorkflowInstanceSubscription, MAX_STRING_LENGTH, OpenWorkflowInstanceSubscription,
    SubscriptionAddress,
};

use super::ResultBuilder;
use crate::correlation::SubscriptionRequest;
use crate::error::{Rejection, Result};
use crate::record::{
    MessageIntent, MessageRecord, MessageSubscriptionIntent, MessageSubscriptionRecord, Payload,
    Record, RecordValue,
};
use crate::state::SubscriptionStatus;

/// Most buffered messages deleted by one expire command.
const EXPIRE_BATCH_SIZE: usize = 128;

fn subscription_address(partition_id: u16, record: &MessageSubscriptionRecord) -> SubscriptionAddress {
    SubscriptionAddress {
        subscription_partition_id: partition_id,
        workflow_instance_partition_id: record.workflow_instance_partition_id,
        workflow_instance_key: record.workflow_instance_key,
        activity_instance_key: record.activity_instance_key,
    }
}

/// Hands a correlated message to the waiting workflow instance.
pub(super) fn correlate_request(partition_id: u16, record: &MessageSubscriptionRecord) -> SubscriptionRequest {
    SubscriptionRequest::new(CorrelateWorkflowInstanceSubscription {
        address: subscription_address(partition_id, record),
        message_name: record.message_name.clone(),
        payload: Bytes::from(record.payload.to_bytes()),
    })
}

pub(super) fn publish(
    b: &mut ResultBuilder<'_>,
    command: &Record,
    value: &MessageRecord,
    max_payload_size: usize,
) -> Result<()> {
    let size = value.payload.encoded_len();
    if size > max_payload_size {
        b.reject(
            command,
            Rejection::bad_value(format!(
                "payload of {size} bytes exceeds the maximum of {max_payload_size} bytes"
            )),
        );
        return Ok(());
    }
    for (field, text) in [("name", &value.name), ("correlation key", &value.correlation_key)] {
        if text.len() > MAX_STRING_LENGTH {
            b.reject(
                command,
                Rejection::bad_value(format!(
                    "message {field} of {} bytes exceeds the maximum of {MAX_STRING_LENGTH} bytes",
                    text.len()
                )),
            );
            return Ok(());
        }
    }
    if value.time_to_live > 0 && value.deadline <= 0 {
        b.reject(
            command,
            Rejection::bad_value("a message with a time to live needs a deadline"),
        );
        return Ok(());
    }
    if b.state().messages.is_duplicate(value) {
        b.reject(
            command,
            Rejection::invalid_state(format!(
                "Expected to publish a new message with id '{}', but a message with that id was already published",
                value.message_id
            )),
        );
        return Ok(());
    }

    let key = b.next_key();
    let published = b.event(
        key,
        RecordValue::Message {
            intent: MessageIntent::Published,
            value: value.clone(),
        },
    );
    b.respond(command, published);

    let waiting: Vec<MessageSubscriptionRecord> = b
        .state()
        .messages
        .waiting_for(&value.name, &value.correlation_key)
        .into_iter()
        .map(|subscription| subscription.record.clone())
        .collect();
    // one message correlates at most once per workflow instance
    let mut correlated_instances = BTreeSet::new();
    for subscription in waiting {
        if correlated_instances.insert(subscription.workflow_instance_key) {
            correlate(b, subscription, key, &value.payload);
        }
    }
    Ok(())
}

/// Delete the buffered messages whose deadline passed by `value.deadline`.
pub(super) fn expire(b: &mut ResultBuilder<'_>, value: &MessageRecord) -> Result<()> {
    let expired: Vec<(i64, MessageRecord)> = b
        .state()
        .messages
        .expired(value.deadline, EXPIRE_BATCH_SIZE)
        .into_iter()
        .map(|(key, message)| (key, message.clone()))
        .collect();
    if !expired.is_empty() {
        debug!(count = expired.len(), now = value.deadline, "Deleting expired messages");
    }
    for (key, message) in expired {
        b.event(
            key,
            RecordValue::Message {
                intent: MessageIntent::Deleted,
                value: message,
            },
        );
    }
    Ok(())
}

fn correlate(
    b: &mut ResultBuilder<'_>,
    subscription: MessageSubscriptionRecord,
    message_key: i64,
    payload: &Payload,
) {
    let record = MessageSubscriptionRecord {
        message_key,
        payload: payload.clone(),
        ..subscription
    };
    b.side_effect(correlate_request(b.partition_id(), &record));
    b.event(
        record.activity_instance_key,
        RecordValue::MessageSubscription {
            intent: MessageSubscriptionIntent::Correlating,
            value: record,
        },
    );
}

pub(super) fn open_subscription(b: &mut ResultBuilder<'_>, value: &MessageSubscriptionRecord) -> Result<()> {
    let confirmation = SubscriptionRequest::new(OpenWorkflowInstanceSubscription {
        address: subscription_address(b.partition_id(), value),
        message_name: value.message_name.clone(),
    });

    if b
        .state()
        .messages
        .subscription(value.activity_instance_key, &value.message_name)
        .is_some()
    {
        debug!(key = value.activity_instance_key, "Subscription already open, confirming again");
        b.side_effect(confirmation);
        return Ok(());
    }

    b.event(
        value.activity_instance_key,
        RecordValue::MessageSubscription {
            intent: MessageSubscriptionIntent::Opened,
            value: value.clone(),
        },
    );
    b.side_effect(confirmation);

    let buffered = b
        .state()
        .messages
        .oldest_uncorrelated(
            &value.message_name,
            &value.correlation_key,
            value.workflow_instance_key,
        )
        .map(|(key, message)| (key, message.payload.clone()));
    if let Some((message_key, payload)) = buffered {
        correlate(b, value.clone(), message_key, &payload);
    }
    Ok(())
}

/// The workflow instance partition acknowledged a correlation.
pub(super) fn correlate_subscription(
    b: &mut ResultBuilder<'_>,
    value: &MessageSubscriptionRecord,
) -> Result<()> {
    let Some(subscription) = b
        .state()
        .messages
        .subscription(value.activity_instance_key, &value.message_name)
        .filter(|subscription| subscription.status == SubscriptionStatus::Correlating)
        .cloned()
    else {
        return Ok(());
    };
    b.event(
        value.activity_instance_key,
        RecordValue::MessageSubscription {
            intent: MessageSubscriptionIntent::Correlated,
            value: subscription.record,
        },
    );
    Ok(())
}

pub(super) fn close_subscription(b: &mut ResultBuilder<'_>, value: &MessageSubscriptionRecord) -> Result<()> {
    let Some(subscription) = b
        .state()
        .messages
        .subscription(value.activity_instance_key, &value.message_name)
        .cloned()
    else {
        return Ok(());
    };
    b.event(
        value.activity_instance_key,
        RecordValue::MessageSubscription {
            intent: MessageSubscriptionIntent::Closed,
            value: subscription.record,
        },
    );
    Ok(())
}
