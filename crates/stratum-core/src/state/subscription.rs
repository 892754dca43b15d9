// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message subscriptions held by element instances on this partition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::WorkflowInstanceSubscriptionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    /// Open request sent, not yet confirmed by the message partition.
    Opening,
    Opened,
    /// Message partition is correlating a message to it.
    Correlating,
    Correlated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstanceSubscription {
    pub status: SubscriptionStatus,
    pub record: WorkflowInstanceSubscriptionRecord,
}

impl WorkflowInstanceSubscription {
    pub fn is_correlatable(&self) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Opening | SubscriptionStatus::Opened
        )
    }
}

/// At most one subscription per (element instance key, message name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    /// element instance key -> message name -> subscription
    subscriptions: BTreeMap<i64, BTreeMap<String, WorkflowInstanceSubscription>>,
}

impl SubscriptionState {
    pub fn get(&self, element_key: i64, message_name: &str) -> Option<&WorkflowInstanceSubscription> {
        self.subscriptions.get(&element_key)?.get(message_name)
    }

    pub fn put(&mut self, status: SubscriptionStatus, record: &WorkflowInstanceSubscriptionRecord) {
        self.subscriptions
            .entry(record.activity_instance_key)
            .or_default()
            .insert(
                record.message_name.clone(),
                WorkflowInstanceSubscription {
                    status,
                    record: record.clone(),
                },
            );
    }

    /// Update the status (and record) of an existing subscription.
    pub fn update(&mut self, status: SubscriptionStatus, record: &WorkflowInstanceSubscriptionRecord) {
        if let Some(subscription) = self
            .subscriptions
            .get_mut(&record.activity_instance_key)
            .and_then(|by_name| by_name.get_mut(&record.message_name))
        {
            subscription.status = status;
            subscription.record = record.clone();
        }
    }

    pub fn remove(&mut self, element_key: i64, message_name: &str) {
        if let Some(by_name) = self.subscriptions.get_mut(&element_key) {
            by_name.remove(message_name);
            if by_name.is_empty() {
                self.subscriptions.remove(&element_key);
            }
        }
    }

    /// Every subscription of an element instance, in message name order.
    pub fn of_element(&self, element_key: i64) -> impl Iterator<Item = &WorkflowInstanceSubscription> {
        self.subscriptions
            .get(&element_key)
            .into_iter()
            .flat_map(|by_name| by_name.values())
    }

    /// Every subscription, in element key order.
    pub fn iter(&self) -> impl Iterator<Item = &WorkflowInstanceSubscription> {
        self.subscriptions.values().flat_map(BTreeMap::values)
    }

    pub fn remove_element(&mut self, element_key: i64) {
        self.subscriptions.remove(&element_key);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
