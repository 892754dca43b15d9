// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde_json::json;

use stratum_protocol::{MAX_STRING_LENGTH, NULL_PARTITION_ID, SubscriptionCommand};

use super::*;
use crate::correlation::subscription_command_record;
use crate::error::RejectionType;
use crate::state::SubscriptionStatus;
use crate::record::{
    FlowElement, IncidentRecord, LATEST_VERSION, NO_KEY, Payload, ProcessDefinition,
    cancel_workflow_instance,
    create_workflow_instance, deploy, expire_messages, publish_message, update_payload,
};

const PARTITION: u16 = 1;

/// Minimal single-partition pipeline: a log, a cursor and a loopback for
/// subscription messages.
struct Harness {
    processor: StreamProcessor,
    state: PartitionState,
    log: Vec<Record>,
    processed: usize,
    outbox: Vec<SubscriptionRequest>,
}

impl Harness {
    fn new() -> Self {
        Self {
            processor: StreamProcessor::new(PARTITION, 1024),
            state: PartitionState::new(PARTITION),
            log: Vec::new(),
            processed: 0,
            outbox: Vec::new(),
        }
    }

    /// Write a command, process it and everything that follows from it.
    fn execute(&mut self, command: Record) -> Record {
        let result = self.execute_only(command);
        self.drain();
        result.response.unwrap()
    }

    /// Write a command and process only that command.
    fn execute_only(&mut self, command: Record) -> ProcessingResult {
        self.drain();
        self.log.push(command);
        self.step()
    }

    fn step(&mut self) -> ProcessingResult {
        let record = self.log[self.processed].clone();
        let result = self.processor.process(&mut self.state, &record);
        self.processed += 1;
        self.log.extend(result.records.iter().cloned());
        self.outbox.extend(result.side_effects.iter().cloned());
        result
    }

    fn drain(&mut self) {
        while self.processed < self.log.len() {
            self.step();
        }
    }

    /// Hand queued subscription messages back to this partition until none
    /// are left.
    fn deliver(&mut self) {
        for _ in 0..16 {
            let outbox = std::mem::take(&mut self.outbox);
            if outbox.is_empty() {
                return;
            }
            for request in outbox {
                let mut command: SubscriptionCommand = request.command;
                if command.address().subscription_partition_id == NULL_PARTITION_ID {
                    command.address_mut().subscription_partition_id = PARTITION;
                }
                self.log.push(subscription_command_record(command).unwrap());
                self.drain();
            }
        }
        panic!("subscription messages kept bouncing");
    }

    fn instance_intents_since(&self, from: usize) -> Vec<(i64, WorkflowInstanceIntent)> {
        self.log[from..]
            .iter()
            .filter(|r| r.is_event())
            .filter_map(|r| r.workflow_instance().map(|(intent, _)| (r.key, intent)))
            .collect()
    }

    fn deploy(&mut self, definition: ProcessDefinition) -> i64 {
        let created = self.execute(deploy(vec![definition]));
        match created.value {
            RecordValue::Deployment { value, .. } => value.processes[0].process_key,
            other => panic!("unexpected deployment response {other:?}"),
        }
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

fn wait_for(process_id: &str, message_name: &str, variable: &str) -> ProcessDefinition {
    ProcessDefinition {
        process_id: process_id.to_string(),
        elements: vec![
            FlowElement::StartEvent {
                id: "start".to_string(),
            },
            FlowElement::MessageCatch {
                id: "wait".to_string(),
                message_name: message_name.to_string(),
                correlation_key: variable.to_string(),
            },
            FlowElement::EndEvent {
                id: "end".to_string(),
            },
        ],
    }
}

fn waiting_child(h: &Harness, root: i64) -> i64 {
    h.state.elements.children(root).next().unwrap().key
}

#[test]
fn test_create_rejects_unknown_process() {
    let mut h = Harness::new();
    let before = h.state.clone();

    let response = h.execute(create_workflow_instance("order", LATEST_VERSION, NO_KEY, Payload::empty()));

    assert_eq!(response.record_type, RecordType::CommandRejection);
    let rejection = response.rejection.unwrap();
    assert_eq!(rejection.rejection_type, RejectionType::BadValue);
    assert!(rejection.reason.contains("process is not deployed"));
    assert_eq!(h.state, before);
}

#[test]
fn test_instance_runs_from_start_to_end() {
    let mut h = Harness::new();
    h.deploy(start_end("order"));

    let from = h.log.len();
    let ready = h.execute(create_workflow_instance(
        "order",
        LATEST_VERSION,
        NO_KEY,
        payload(json!({"a": 1})),
    ));
    let root = ready.key;
    let (intent, value) = ready.workflow_instance().unwrap();
    assert_eq!(intent, WorkflowInstanceIntent::ElementReady);
    assert_eq!(value.workflow_instance_key, root);
    assert_eq!(value.version, 1);

    let intents: Vec<_> = h
        .instance_intents_since(from)
        .into_iter()
        .map(|(_, intent)| intent)
        .collect();
    assert_eq!(
        intents,
        vec![
            WorkflowInstanceIntent::ElementReady,
            WorkflowInstanceIntent::ElementActivated,
            WorkflowInstanceIntent::StartEventOccurred,
            WorkflowInstanceIntent::EndEventOccurred,
            WorkflowInstanceIntent::ElementCompleting,
            WorkflowInstanceIntent::ElementCompleted,
        ]
    );
    assert!(h.state.elements.is_empty());
}

#[test]
fn test_cancel_emits_canceling_then_terminating_with_empty_payload() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "var1"));
    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            payload(json!({"var1": "value1"})),
        ))
        .key;
    let child = waiting_child(&h, root);

    let result = h.execute_only(cancel_workflow_instance(root));

    let emitted: Vec<_> = result
        .records
        .iter()
        .map(|r| r.workflow_instance().unwrap())
        .collect();
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0].0, WorkflowInstanceIntent::Canceling);
    assert_eq!(emitted[1].0, WorkflowInstanceIntent::ElementTerminating);
    assert!(emitted.iter().all(|(_, value)| value.payload == Payload::empty()));
    // visible before anything else is processed
    assert_eq!(
        h.state.elements.get(root).unwrap().state,
        WorkflowInstanceIntent::ElementTerminating
    );

    let from = h.log.len();
    h.drain();
    assert_eq!(
        h.instance_intents_since(from),
        vec![
            (child, WorkflowInstanceIntent::ElementTerminated),
            (root, WorkflowInstanceIntent::ElementTerminated),
        ]
    );
    assert!(h.state.elements.is_empty());
    assert!(h.state.subscriptions.is_empty());
    assert!(
        h.outbox
            .iter()
            .any(|r| matches!(r.command, SubscriptionCommand::CloseMessageSubscription(_)))
    );
}

#[test]
fn test_cancel_of_terminating_instance_is_rejected() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "var1"));
    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            payload(json!({"var1": "value1"})),
        ))
        .key;

    h.execute_only(cancel_workflow_instance(root));
    // a second cancel while ELEMENT_TERMINATING is still unprocessed
    let result = h
        .processor
        .process(&mut h.state, &cancel_workflow_instance(root));

    assert_eq!(result.records.len(), 1);
    let rejection = result.response.unwrap().rejection.unwrap();
    assert_eq!(rejection.rejection_type, RejectionType::NotApplicable);
    let terminating = h
        .instance_intents_since(0)
        .into_iter()
        .filter(|(_, intent)| *intent == WorkflowInstanceIntent::ElementTerminating)
        .count();
    assert_eq!(terminating, 1);
}

#[test]
fn test_cancel_of_child_instance_is_rejected() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "var1"));
    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            payload(json!({"var1": "value1"})),
        ))
        .key;
    let child = waiting_child(&h, root);

    let response = h.execute(cancel_workflow_instance(child));

    let rejection = response.rejection.unwrap();
    assert_eq!(rejection.rejection_type, RejectionType::NotApplicable);
    assert!(rejection.reason.contains("only workflow instances can be cancelled"));
    assert!(h.state.elements.get(child).unwrap().is_active());
}

#[test]
fn test_update_payload_of_unknown_instance_is_rejected() {
    let mut h = Harness::new();
    let response = h.execute(update_payload(12345, payload(json!({"x": 1}))));
    let rejection = response.rejection.unwrap();
    assert_eq!(rejection.rejection_type, RejectionType::NotApplicable);
    assert!(rejection.reason.contains("workflow instance is not running"));
}

#[test]
fn test_update_payload_replaces_document() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "var1"));
    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            payload(json!({"var1": "value1", "other": true})),
        ))
        .key;

    let response = h.execute(update_payload(root, payload(json!({"var1": "value2"}))));
    assert_eq!(
        response.workflow_instance().unwrap().0,
        WorkflowInstanceIntent::PayloadUpdated
    );
    assert_eq!(
        h.state.elements.get(root).unwrap().record.payload,
        payload(json!({"var1": "value2"}))
    );
}

#[test]
fn test_unresolved_correlation_key_raises_incident_and_retries_after_update() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "orderId"));
    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            Payload::empty(),
        ))
        .key;

    let incident = h
        .log
        .iter()
        .find_map(|r| match &r.value {
            RecordValue::Incident {
                intent: IncidentIntent::Created,
                value,
            } => Some(value.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(incident.error_type, "IO_MAPPING_ERROR");
    let child = incident.element_instance_key;
    assert!(h.state.elements.get(child).is_none());
    assert!(h.state.elements.failed_token(child).is_some());
    assert!(h.outbox.is_empty());

    let from = h.log.len();
    h.execute(update_payload(child, payload(json!({"orderId": 42}))));

    assert_eq!(
        h.instance_intents_since(from)[..2],
        [
            (child, WorkflowInstanceIntent::PayloadUpdated),
            (child, WorkflowInstanceIntent::ElementActivated),
        ]
    );
    assert!(h.state.elements.failed_token(child).is_none());
    let subscription = h.state.subscriptions.get(child, "paid").unwrap();
    assert_eq!(subscription.record.correlation_key, "42");
    assert_eq!(subscription.record.workflow_instance_key, root);
    assert_eq!(h.outbox.len(), 1);
}

#[test]
fn test_published_message_completes_waiting_instance() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "orderId"));
    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            payload(json!({"orderId": "o-1", "amount": 1})),
        ))
        .key;
    h.deliver();
    let child = waiting_child(&h, root);
    assert_eq!(
        h.state.subscriptions.get(child, "paid").unwrap().status,
        SubscriptionStatus::Opened
    );

    let from = h.log.len();
    h.execute(publish_message("paid", "o-1", "", 0, payload(json!({"amount": 2}))));
    h.deliver();

    let intents = h.instance_intents_since(from);
    assert!(intents.contains(&(child, WorkflowInstanceIntent::ElementCompleting)));
    assert!(intents.contains(&(root, WorkflowInstanceIntent::ElementCompleted)));
    let completing = h.log[from..]
        .iter()
        .filter_map(|r| r.workflow_instance())
        .find(|(intent, value)| *intent == WorkflowInstanceIntent::ElementCompleting && value.is_root())
        .map(|(_, value)| value.payload.clone())
        .unwrap();
    assert_eq!(completing, payload(json!({"orderId": "o-1", "amount": 2})));
    assert!(h.state.elements.is_empty());
    assert_eq!(h.state.messages.subscription_len(), 0);
}

#[test]
fn test_buffered_message_correlates_to_later_subscription() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "orderId"));
    h.execute(publish_message("paid", "o-9", "m-1", 60_000, Payload::empty()));
    assert_eq!(h.state.messages.buffered_len(), 1);

    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            payload(json!({"orderId": "o-9"})),
        ))
        .key;
    h.deliver();

    assert!(h.state.elements.get(root).is_none());
    assert_eq!(h.state.messages.buffered_len(), 1);
}

#[test]
fn test_duplicate_message_id_is_rejected() {
    let mut h = Harness::new();
    h.execute(publish_message("paid", "o-1", "m-1", 60_000, Payload::empty()));
    let response = h.execute(publish_message("paid", "o-1", "m-1", 60_000, Payload::empty()));
    assert_eq!(
        response.rejection.unwrap().rejection_type,
        RejectionType::InvalidState
    );
}

#[test]
fn test_repeated_open_is_confirmed_without_events() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "orderId"));
    h.execute(create_workflow_instance(
        "order",
        LATEST_VERSION,
        NO_KEY,
        payload(json!({"orderId": "o-1"})),
    ));
    let open = h
        .outbox
        .iter()
        .find(|r| matches!(r.command, SubscriptionCommand::OpenMessageSubscription(_)))
        .cloned()
        .unwrap();
    h.deliver();

    let mut command = open.command;
    command.address_mut().subscription_partition_id = PARTITION;
    let result = h.execute_only(subscription_command_record(command).unwrap());

    assert!(result.records.is_empty());
    assert_eq!(result.side_effects.len(), 1);
    assert!(matches!(
        result.side_effects[0].command,
        SubscriptionCommand::OpenWorkflowInstanceSubscription(_)
    ));
}

#[test]
fn test_deployment_versions_and_validation() {
    let mut h = Harness::new();
    let first = h.deploy(start_end("order"));
    let second = h.deploy(start_end("order"));
    assert_ne!(first, second);
    assert_eq!(h.state.processes.latest("order").unwrap().version, 2);

    let ready = h.execute(create_workflow_instance("order", 1, NO_KEY, Payload::empty()));
    assert_eq!(ready.workflow_instance().unwrap().1.process_key, first);

    let invalid = ProcessDefinition {
        process_id: "broken".to_string(),
        elements: vec![],
    };
    let response = h.execute(deploy(vec![invalid]));
    assert_eq!(
        response.rejection.unwrap().rejection_type,
        RejectionType::BadValue
    );
}

#[test]
fn test_event_intent_as_command_is_rejected() {
    let mut h = Harness::new();
    let command = Record::command(
        NO_KEY,
        RecordValue::Message {
            intent: MessageIntent::Published,
            value: crate::record::MessageRecord {
                name: "paid".to_string(),
                correlation_key: "o-1".to_string(),
                message_id: String::new(),
                time_to_live: 0,
                deadline: 0,
                payload: Payload::empty(),
            },
        },
    );
    let response = h.execute(command);
    assert_eq!(response.record_type, RecordType::CommandRejection);
}

#[test]
fn test_oversized_correlation_key_is_rejected_on_publish() {
    let mut h = Harness::new();
    let correlation_key = "k".repeat(MAX_STRING_LENGTH + 1);

    let response = h.execute(publish_message("paid", correlation_key, "m-1", 60_000, Payload::empty()));

    let rejection = response.rejection.unwrap();
    assert_eq!(rejection.rejection_type, RejectionType::BadValue);
    assert!(rejection.reason.contains("correlation key"));
    assert_eq!(h.state.messages.buffered_len(), 0);
}

#[test]
fn test_oversized_correlation_value_raises_incident_instead_of_subscribing() {
    let mut h = Harness::new();
    h.processor = StreamProcessor::new(PARTITION, 4 * MAX_STRING_LENGTH);
    h.deploy(wait_for("order", "paid", "orderId"));

    h.execute(create_workflow_instance(
        "order",
        LATEST_VERSION,
        NO_KEY,
        payload(json!({"orderId": "k".repeat(MAX_STRING_LENGTH + 1)})),
    ));

    let incident = h
        .log
        .iter()
        .find_map(|r| match &r.value {
            RecordValue::Incident {
                intent: IncidentIntent::Created,
                value,
            } => Some(value.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(incident.error_type, "FATAL");
    assert!(h.state.elements.failed_token(incident.element_instance_key).is_some());
    assert!(h.state.subscriptions.is_empty());
    assert!(h.outbox.is_empty());
}

#[test]
fn test_cancel_of_failed_root_resolves_its_incident() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "orderId"));
    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            payload(json!({"orderId": "o-1"})),
        ))
        .key;
    let child = waiting_child(&h, root);
    let incident_key = h.state.keys.next_key();
    h.state.apply(&Record::event(
        incident_key,
        RecordValue::Incident {
            intent: IncidentIntent::Created,
            value: IncidentRecord {
                error_type: "FATAL".to_string(),
                error_message: "boom".to_string(),
                workflow_instance_key: root,
                element_instance_key: root,
                element_id: "order".to_string(),
            },
        },
    ));
    assert!(h.state.elements.failed_token(root).is_some());

    let from = h.log.len();
    h.execute(cancel_workflow_instance(root));

    let resolved: Vec<i64> = h.log[from..]
        .iter()
        .filter(|r| {
            matches!(
                r.value,
                RecordValue::Incident {
                    intent: IncidentIntent::Resolved,
                    ..
                }
            )
        })
        .map(|r| r.key)
        .collect();
    assert_eq!(resolved, vec![incident_key]);
    assert_eq!(
        h.instance_intents_since(from).last(),
        Some(&(root, WorkflowInstanceIntent::ElementTerminated))
    );
    assert!(h.state.elements.get(child).is_none());
    assert!(h.state.elements.get(root).is_none());
    assert!(h.state.elements.failed_token(root).is_none());
}

fn published_deadline(h: &Harness) -> i64 {
    h.log
        .iter()
        .find_map(|r| match &r.value {
            RecordValue::Message {
                intent: MessageIntent::Published,
                value,
            } => Some(value.deadline),
            _ => None,
        })
        .unwrap()
}

#[test]
fn test_expired_message_is_deleted_and_no_longer_correlates() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "orderId"));
    h.execute(publish_message("paid", "o-1", "m-1", 60_000, Payload::empty()));
    let deadline = published_deadline(&h);

    let result = h.execute_only(expire_messages(deadline - 1));
    assert!(result.records.is_empty());
    assert_eq!(h.state.messages.buffered_len(), 1);

    let result = h.execute_only(expire_messages(deadline));
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].value.intent_name(), "DELETED");
    assert_eq!(h.state.messages.buffered_len(), 0);
    assert!(h.state.messages.expired(i64::MAX, 16).is_empty());

    // the id is free again once the message is gone
    let response = h.execute(publish_message("paid", "o-1", "m-1", 0, Payload::empty()));
    assert!(response.rejection.is_none());

    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            payload(json!({"orderId": "o-1"})),
        ))
        .key;
    h.deliver();
    let child = waiting_child(&h, root);
    assert_eq!(
        h.state.subscriptions.get(child, "paid").unwrap().status,
        SubscriptionStatus::Opened
    );
}

#[test]
fn test_buffered_publish_without_deadline_is_rejected() {
    let mut h = Harness::new();
    let command = Record::command(
        NO_KEY,
        RecordValue::Message {
            intent: MessageIntent::Publish,
            value: crate::record::MessageRecord {
                name: "paid".to_string(),
                correlation_key: "o-1".to_string(),
                message_id: String::new(),
                time_to_live: 60_000,
                deadline: 0,
                payload: Payload::empty(),
            },
        },
    );

    let response = h.execute(command);

    assert_eq!(
        response.rejection.unwrap().rejection_type,
        RejectionType::BadValue
    );
    assert_eq!(h.state.messages.buffered_len(), 0);
}

#[test]
fn test_repeated_correlation_is_only_acknowledged() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "orderId"));
    let root = h
        .execute(create_workflow_instance(
            "order",
            LATEST_VERSION,
            NO_KEY,
            payload(json!({"orderId": "o-1"})),
        ))
        .key;
    h.deliver();
    let child = waiting_child(&h, root);

    h.execute(publish_message("paid", "o-1", "", 0, payload(json!({"amount": 2}))));
    let correlate = h
        .outbox
        .iter()
        .find(|r| {
            matches!(
                r.command,
                SubscriptionCommand::CorrelateWorkflowInstanceSubscription(_)
            )
        })
        .cloned()
        .unwrap();
    let correlate = subscription_command_record(correlate.command).unwrap();

    let first = h.execute_only(correlate.clone());
    assert_eq!(first.records.len(), 2);
    assert_eq!(
        h.state.subscriptions.get(child, "paid").unwrap().status,
        SubscriptionStatus::Correlated
    );

    // again while the element is still completing
    let repeated = h.processor.process(&mut h.state, &correlate);
    assert!(repeated.records.is_empty());
    assert_eq!(repeated.side_effects.len(), 1);
    assert!(matches!(
        repeated.side_effects[0].command,
        SubscriptionCommand::CorrelateMessageSubscription(_)
    ));

    h.drain();
    assert!(h.state.elements.get(root).is_none());

    // and again after the instance completed
    let late = h.execute_only(correlate);
    assert!(late.records.is_empty());
    assert_eq!(late.side_effects.len(), 1);
    assert!(matches!(
        late.side_effects[0].command,
        SubscriptionCommand::CorrelateMessageSubscription(_)
    ));
    assert!(h.state.elements.is_empty());
    assert!(h.state.subscriptions.is_empty());
}

#[test]
fn test_unconfirmed_requests_are_rebuilt_from_state() {
    let mut h = Harness::new();
    h.deploy(wait_for("order", "paid", "orderId"));
    h.execute(create_workflow_instance(
        "order",
        LATEST_VERSION,
        NO_KEY,
        payload(json!({"orderId": "o-1"})),
    ));
    assert_eq!(h.outbox.len(), 1);
    assert_eq!(h.processor.unconfirmed_requests(&h.state), h.outbox);

    h.deliver();
    assert!(h.processor.unconfirmed_requests(&h.state).is_empty());

    h.execute(publish_message("paid", "o-1", "", 0, payload(json!({"amount": 2}))));
    let rebuilt = h.processor.unconfirmed_requests(&h.state);
    assert_eq!(rebuilt.len(), 1);
    assert_eq!(rebuilt, h.outbox);
    assert!(matches!(
        rebuilt[0].command,
        SubscriptionCommand::CorrelateWorkflowInstanceSubscription(_)
    ));

    h.deliver();
    assert!(h.processor.unconfirmed_requests(&h.state).is_empty());
}
