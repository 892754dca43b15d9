// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Indexed partition state.
//!
//! [`PartitionState`] is rebuilt from the latest snapshot plus the events that
//! follow it in the log. Only events change it, through [`PartitionState::apply`];
//! commands are read by the stream processor but never applied. Applying the
//! same events in the same order always yields the same state.

mod element_instance;
mod message;
mod process;
mod subscription;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use element_instance::{DeferredRecord, ElementInstance, ElementInstanceState, FailedToken};
pub use message::{MessageState, MessageSubscription};
pub use process::ProcessState;
pub use subscription::{SubscriptionState, SubscriptionStatus, WorkflowInstanceSubscription};

use crate::record::{
    DeploymentIntent, FlowElement, IncidentIntent, MessageIntent, MessageSubscriptionIntent,
    Record, RecordValue, WorkflowInstanceIntent, WorkflowInstanceRecord,
    WorkflowInstanceSubscriptionIntent, encode_key, key_counter, key_partition,
};

/// Generates keys that are unique across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenerator {
    partition_id: u16,
    next: i64,
}

impl KeyGenerator {
    pub fn new(partition_id: u16) -> Self {
        Self {
            partition_id,
            next: 1,
        }
    }

    pub fn next_key(&mut self) -> i64 {
        let key = encode_key(self.partition_id, self.next);
        self.next += 1;
        key
    }

    /// Make sure a key read from the log is never generated again.
    pub fn observe(&mut self, key: i64) {
        if key >= 0 && key_partition(key) == self.partition_id {
            let counter = key_counter(key);
            if counter >= self.next {
                self.next = counter + 1;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    pub partition_id: u16,
    pub keys: KeyGenerator,
    pub processes: ProcessState,
    pub elements: ElementInstanceState,
    pub subscriptions: SubscriptionState,
    pub messages: MessageState,
}

impl PartitionState {
    pub fn new(partition_id: u16) -> Self {
        Self {
            partition_id,
            keys: KeyGenerator::new(partition_id),
            processes: ProcessState::default(),
            elements: ElementInstanceState::default(),
            subscriptions: SubscriptionState::default(),
            messages: MessageState::default(),
        }
    }

    /// Apply one event. Commands and rejections leave the state untouched.
    pub fn apply(&mut self, record: &Record) {
        if !record.is_event() {
            return;
        }
        self.keys.observe(record.key);

        match &record.value {
            RecordValue::Deployment { intent, value } => {
                if *intent == DeploymentIntent::Created {
                    for process in &value.processes {
                        self.keys.observe(process.process_key);
                        self.processes.put(process.clone());
                    }
                }
            }
            RecordValue::WorkflowInstance { intent, value } => {
                self.apply_workflow_instance(record.key, *intent, value);
            }
            RecordValue::Message { intent, value } => match intent {
                MessageIntent::Published if value.time_to_live > 0 => {
                    self.messages.buffer(record.key, value);
                }
                MessageIntent::Deleted => self.messages.remove(record.key),
                _ => {}
            },
            RecordValue::MessageSubscription { intent, value } => match intent {
                MessageSubscriptionIntent::Opened => {
                    self.messages
                        .put_subscription(SubscriptionStatus::Opened, value);
                }
                MessageSubscriptionIntent::Correlating => self.messages.correlating(value),
                MessageSubscriptionIntent::Correlated | MessageSubscriptionIntent::Closed => {
                    self.messages
                        .remove_subscription(value.activity_instance_key, &value.message_name);
                }
                _ => {}
            },
            RecordValue::WorkflowInstanceSubscription { intent, value } => match intent {
                WorkflowInstanceSubscriptionIntent::Opening => {
                    self.subscriptions.put(SubscriptionStatus::Opening, value);
                }
                WorkflowInstanceSubscriptionIntent::Opened => {
                    self.subscriptions.update(SubscriptionStatus::Opened, value);
                }
                WorkflowInstanceSubscriptionIntent::Correlated => {
                    self.subscriptions.update(SubscriptionStatus::Correlated, value);
                }
                WorkflowInstanceSubscriptionIntent::Closed => {
                    self.subscriptions
                        .remove(value.activity_instance_key, &value.message_name);
                }
                _ => {}
            },
            RecordValue::Incident { intent, value } => {
                if *intent == IncidentIntent::Created {
                    self.elements.fail(record.key, value);
                }
            }
        }
    }

    fn apply_workflow_instance(
        &mut self,
        key: i64,
        intent: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) {
        use WorkflowInstanceIntent::*;

        match intent {
            ElementReady => {
                self.elements.transition(key, intent, record);
                if record.is_root() {
                    let start_event = self
                        .processes
                        .by_key(record.process_key)
                        .and_then(|process| process.definition.start_event())
                        .map(FlowElement::id)
                        .unwrap_or_default()
                        .to_string();
                    self.elements.defer(
                        key,
                        DeferredRecord {
                            intent: StartEventOccurred,
                            record: WorkflowInstanceRecord {
                                element_id: start_event,
                                scope_key: key,
                                ..record.clone()
                            },
                        },
                    );
                }
            }
            ElementActivated => {
                self.elements.remove_failed_token(key);
                self.elements.transition(key, intent, record);
            }
            ElementCompleting | ElementTerminating => {
                self.elements.transition(key, intent, record);
            }
            ElementCompleted | ElementTerminated => {
                self.elements.remove(key);
                self.subscriptions.remove_element(key);
            }
            StartEventOccurred => {
                self.elements.consume_deferred(record.scope_key, intent);
            }
            PayloadUpdated => {
                if !self.elements.set_payload(key, record) {
                    debug!(key, "Payload update for unknown element instance");
                }
            }
            EndEventOccurred | Canceling => {}
            Create | Cancel | UpdatePayload => {}
        }
    }
}
