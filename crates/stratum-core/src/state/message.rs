// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Buffered messages and the subscriptions waiting for them, as kept on the
//! partition a correlation key hashes to.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::subscription::SubscriptionStatus;
use crate::record::{MessageRecord, MessageSubscriptionRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSubscription {
    pub status: SubscriptionStatus,
    pub record: MessageSubscriptionRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    /// message key -> buffered message
    messages: BTreeMap<i64, MessageRecord>,
    /// activity instance key -> message name -> subscription
    subscriptions: BTreeMap<i64, BTreeMap<String, MessageSubscription>>,
    /// (message key, workflow instance key) pairs already correlated
    correlated: BTreeSet<(i64, i64)>,
}

impl MessageState {
    pub fn buffer(&mut self, key: i64, message: &MessageRecord) {
        self.messages.insert(key, message.clone());
    }

    pub fn message(&self, key: i64) -> Option<&MessageRecord> {
        self.messages.get(&key)
    }

    pub fn buffered_len(&self) -> usize {
        self.messages.len()
    }

    /// Up to `limit` buffered messages whose deadline is at or before `now`,
    /// in key order.
    pub fn expired(&self, now: i64, limit: usize) -> Vec<(i64, &MessageRecord)> {
        self.messages
            .iter()
            .filter(|(_, message)| message.deadline <= now)
            .take(limit)
            .map(|(key, message)| (*key, message))
            .collect()
    }

    /// Drop a buffered message together with its correlation marks.
    pub fn remove(&mut self, key: i64) {
        if self.messages.remove(&key).is_some() {
            self.correlated
                .retain(|(message_key, _)| *message_key != key);
        }
    }

    /// Whether a message with this id is buffered for the same name and key.
    pub fn is_duplicate(&self, message: &MessageRecord) -> bool {
        !message.message_id.is_empty()
            && self.messages.values().any(|buffered| {
                buffered.message_id == message.message_id
                    && buffered.name == message.name
                    && buffered.correlation_key == message.correlation_key
            })
    }

    /// Oldest buffered message matching `name`/`correlation_key` that was not
    /// yet correlated to `workflow_instance_key`.
    pub fn oldest_uncorrelated(
        &self,
        name: &str,
        correlation_key: &str,
        workflow_instance_key: i64,
    ) -> Option<(i64, &MessageRecord)> {
        self.messages
            .iter()
            .find(|(key, message)| {
                message.name == name
                    && message.correlation_key == correlation_key
                    && !self.correlated.contains(&(**key, workflow_instance_key))
            })
            .map(|(key, message)| (*key, message))
    }

    pub fn subscription(&self, activity_instance_key: i64, message_name: &str) -> Option<&MessageSubscription> {
        self.subscriptions
            .get(&activity_instance_key)?
            .get(message_name)
    }

    /// Opened subscriptions waiting for `name`/`correlation_key`, in key order.
    pub fn waiting_for(&self, name: &str, correlation_key: &str) -> Vec<&MessageSubscription> {
        self.subscriptions
            .values()
            .filter_map(|by_name| by_name.get(name))
            .filter(|subscription| {
                subscription.status == SubscriptionStatus::Opened
                    && subscription.record.correlation_key == correlation_key
            })
            .collect()
    }

    pub fn put_subscription(&mut self, status: SubscriptionStatus, record: &MessageSubscriptionRecord) {
        self.subscriptions
            .entry(record.activity_instance_key)
            .or_default()
            .insert(
                record.message_name.clone(),
                MessageSubscription {
                    status,
                    record: record.clone(),
                },
            );
    }

    /// Mark a subscription as correlating `record.message_key`.
    pub fn correlating(&mut self, record: &MessageSubscriptionRecord) {
        if let Some(subscription) = self
            .subscriptions
            .get_mut(&record.activity_instance_key)
            .and_then(|by_name| by_name.get_mut(&record.message_name))
        {
            subscription.status = SubscriptionStatus::Correlating;
            subscription.record.message_key = record.message_key;
            subscription.record.payload = record.payload.clone();
        }
        if self.messages.contains_key(&record.message_key) {
            self.correlated
                .insert((record.message_key, record.workflow_instance_key));
        }
    }

    pub fn remove_subscription(&mut self, activity_instance_key: i64, message_name: &str) {
        if let Some(by_name) = self.subscriptions.get_mut(&activity_instance_key) {
            by_name.remove(message_name);
            if by_name.is_empty() {
                self.subscriptions.remove(&activity_instance_key);
            }
        }
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &MessageSubscription> {
        self.subscriptions.values().flat_map(BTreeMap::values)
    }

    pub fn subscription_len(&self) -> usize {
        self.subscriptions.values().map(BTreeMap::len).sum()
    }
}
