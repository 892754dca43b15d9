// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stream processor: the command/event state machine of a partition.
//!
//! [`StreamProcessor::process`] takes the partition state and one record read
//! from the log and returns the follow-up records to append, the subscription
//! messages to send once they are durable, and the response for the
//! command's originator. Every follow-up event is applied to the state as
//! soon as it is emitted, so later steps of the same batch (and later
//! records) observe it.
//!
//! Processing is deterministic: the same state and record always produce the
//! same result. Handlers never look at wall clock time or request metadata.

mod deployment;
mod message;
mod subscription;
mod workflow_instance;

use tracing::{error, instrument, warn};

use crate::correlation::SubscriptionRequest;
use crate::error::{CoreError, Rejection, Result};
use crate::record::{
    DeploymentIntent, IncidentIntent, IncidentRecord, MessageIntent, MessageSubscriptionIntent,
    Record, RecordType, RecordValue, WorkflowInstanceIntent, WorkflowInstanceSubscriptionIntent,
};
use crate::state::{PartitionState, SubscriptionStatus};

/// Everything processing one record produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingResult {
    /// Follow-up records, in emission order.
    pub records: Vec<Record>,
    /// Subscription messages to send after `records` are written.
    pub side_effects: Vec<SubscriptionRequest>,
    /// Event or rejection answering the processed command.
    pub response: Option<Record>,
}

impl ProcessingResult {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.side_effects.is_empty() && self.response.is_none()
    }
}

/// Collects the output of one processing step and keeps the state in sync
/// with every event it emits.
pub(crate) struct ResultBuilder<'a> {
    state: &'a mut PartitionState,
    result: ProcessingResult,
}

impl<'a> ResultBuilder<'a> {
    fn new(state: &'a mut PartitionState) -> Self {
        Self {
            state,
            result: ProcessingResult::default(),
        }
    }

    pub(crate) fn state(&self) -> &PartitionState {
        self.state
    }

    pub(crate) fn partition_id(&self) -> u16 {
        self.state.partition_id
    }

    pub(crate) fn next_key(&mut self) -> i64 {
        self.state.keys.next_key()
    }

    /// Emit an event and apply it.
    pub(crate) fn event(&mut self, key: i64, value: RecordValue) -> Record {
        let record = Record::event(key, value);
        self.state.apply(&record);
        self.result.records.push(record.clone());
        record
    }

    /// Reject `command` and answer its originator with the rejection.
    pub(crate) fn reject(&mut self, command: &Record, rejection: Rejection) {
        let record = Record::rejection(command, rejection);
        self.result.response = Some(record.clone());
        self.result.records.push(record);
    }

    pub(crate) fn respond(&mut self, command: &Record, mut response: Record) {
        response.request = command.request;
        self.result.response = Some(response);
    }

    pub(crate) fn side_effect(&mut self, request: SubscriptionRequest) {
        self.result.side_effects.push(request);
    }

    fn finish(self) -> ProcessingResult {
        self.result
    }
}

/// Processes the records of one partition.
#[derive(Debug, Clone)]
pub struct StreamProcessor {
    partition_id: u16,
    max_payload_size: usize,
}

impl StreamProcessor {
    pub fn new(partition_id: u16, max_payload_size: usize) -> Self {
        Self {
            partition_id,
            max_payload_size,
        }
    }

    pub fn partition_id(&self) -> u16 {
        self.partition_id
    }

    /// Subscription messages still waiting for their confirmation in
    /// `state`, rebuilt as they were first sent.
    pub fn unconfirmed_requests(&self, state: &PartitionState) -> Vec<SubscriptionRequest> {
        let opening = state
            .subscriptions
            .iter()
            .filter(|subscription| subscription.status == SubscriptionStatus::Opening)
            .map(|subscription| {
                workflow_instance::open_request(self.partition_id, &subscription.record)
            });
        let correlating = state
            .messages
            .subscriptions()
            .filter(|subscription| subscription.status == SubscriptionStatus::Correlating)
            .map(|subscription| message::correlate_request(self.partition_id, &subscription.record));
        opening.chain(correlating).collect()
    }

    /// Process one record read from the log.
    ///
    /// The record itself must already be reflected in `state` when it is an
    /// event; only its follow-ups are applied here.
    #[instrument(level = "debug", skip(self, state, record), fields(partition_id = self.partition_id, key = record.key, intent = %record.value.intent_name()))]
    pub fn process(&self, state: &mut PartitionState, record: &Record) -> ProcessingResult {
        let mut builder = ResultBuilder::new(state);
        let outcome = match record.record_type {
            RecordType::Command => self.process_command(&mut builder, record),
            RecordType::Event => self.process_event(&mut builder, record),
            RecordType::CommandRejection => Ok(()),
        };
        if let Err(e) = outcome {
            raise_incident(&mut builder, e);
        }
        builder.finish()
    }

    fn process_command(&self, b: &mut ResultBuilder<'_>, command: &Record) -> Result<()> {
        match &command.value {
            RecordValue::Deployment {
                intent: DeploymentIntent::Create,
                value,
            } => deployment::create(b, command, value),
            RecordValue::WorkflowInstance { intent, value } => match intent {
                WorkflowInstanceIntent::Create => {
                    workflow_instance::create(b, command, value, self.max_payload_size)
                }
                WorkflowInstanceIntent::Cancel => workflow_instance::cancel(b, command),
                WorkflowInstanceIntent::UpdatePayload => {
                    workflow_instance::update_payload(b, command, value, self.max_payload_size)
                }
                _ => not_a_command(b, command),
            },
            RecordValue::Message { intent, value } => match intent {
                MessageIntent::Publish => {
                    message::publish(b, command, value, self.max_payload_size)
                }
                MessageIntent::Expire => message::expire(b, value),
                _ => not_a_command(b, command),
            },
            RecordValue::MessageSubscription { intent, value } => match intent {
                MessageSubscriptionIntent::Open => message::open_subscription(b, value),
                MessageSubscriptionIntent::Correlate => message::correlate_subscription(b, value),
                MessageSubscriptionIntent::Close => message::close_subscription(b, value),
                _ => not_a_command(b, command),
            },
            RecordValue::WorkflowInstanceSubscription { intent, value } => match intent {
                WorkflowInstanceSubscriptionIntent::Open => subscription::open(b, value),
                WorkflowInstanceSubscriptionIntent::Correlate => subscription::correlate(b, value),
                _ => not_a_command(b, command),
            },
            _ => not_a_command(b, command),
        }
    }

    fn process_event(&self, b: &mut ResultBuilder<'_>, event: &Record) -> Result<()> {
        match &event.value {
            RecordValue::WorkflowInstance { intent, value } => {
                workflow_instance::process_event(b, event.key, *intent, value)
            }
            // every other event only changes state
            _ => Ok(()),
        }
    }
}

fn not_a_command(b: &mut ResultBuilder<'_>, command: &Record) -> Result<()> {
    warn!(intent = %command.value.intent_name(), "Received an event intent as a command");
    b.reject(
        command,
        Rejection::not_applicable(format!(
            "'{}' cannot be submitted as a command",
            command.value.intent_name()
        )),
    );
    Ok(())
}

/// Record an incident for the element instance an error belongs to.
fn raise_incident(b: &mut ResultBuilder<'_>, error: CoreError) {
    let Some(key) = error.instance_key() else {
        error!(error = %error, "Failed to process record");
        return;
    };
    let Some(instance) = b.state().elements.get(key).cloned() else {
        error!(key, error = %error, "Failed to process record of a missing element instance");
        return;
    };

    error!(
        key,
        error_code = error.error_code(),
        error = %error,
        "Raising incident"
    );
    let incident_key = b.next_key();
    b.event(
        incident_key,
        RecordValue::Incident {
            intent: IncidentIntent::Created,
            value: IncidentRecord {
                error_type: error.error_code().to_string(),
                error_message: error.to_string(),
                workflow_instance_key: instance.record.workflow_instance_key,
                element_instance_key: key,
                element_id: instance.record.element_id,
            },
        },
    );
}

#[cfg(test)]
mod tests;
