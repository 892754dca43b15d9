// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow instance commands and the token flow driven by its events.

use serde_json::Value;
use tracing::debug;

use stratum_protocol::{
    CloseMessageSubscription, MAX_STRING_LENGTH, NULL_PARTITION_ID, OpenMessageSubscription,
    SubscriptionAddress,
};

use super::ResultBuilder;
use crate::correlation::SubscriptionRequest;
use crate::error::{CoreError, Rejection, Result};
use crate::record::{
    DeployedProcess, FlowElement, IncidentIntent, LATEST_VERSION, NO_KEY, Payload, Record,
    RecordValue, WorkflowInstanceIntent, WorkflowInstanceRecord, WorkflowInstanceSubscriptionIntent,
    WorkflowInstanceSubscriptionRecord,
};
use crate::state::{ElementInstance, PartitionState};

fn instance_value(intent: WorkflowInstanceIntent, value: WorkflowInstanceRecord) -> RecordValue {
    RecordValue::WorkflowInstance { intent, value }
}

fn resolve_process<'s>(state: &'s PartitionState, value: &WorkflowInstanceRecord) -> Option<&'s DeployedProcess> {
    if value.process_key >= 0 {
        state.processes.by_key(value.process_key)
    } else if value.version == LATEST_VERSION {
        state.processes.latest(&value.process_id)
    } else {
        state.processes.by_id_and_version(&value.process_id, value.version)
    }
}

fn payload_too_large(payload: &Payload, max_payload_size: usize) -> Option<Rejection> {
    let size = payload.encoded_len();
    (size > max_payload_size).then(|| {
        Rejection::bad_value(format!(
            "payload of {size} bytes exceeds the maximum of {max_payload_size} bytes"
        ))
    })
}

// ============================================================================
// Commands
// ============================================================================

pub(super) fn create(
    b: &mut ResultBuilder<'_>,
    command: &Record,
    value: &WorkflowInstanceRecord,
    max_payload_size: usize,
) -> Result<()> {
    let Some(process) = resolve_process(b.state(), value).cloned() else {
        b.reject(command, Rejection::bad_value("process is not deployed"));
        return Ok(());
    };
    if let Some(rejection) = payload_too_large(&value.payload, max_payload_size) {
        b.reject(command, rejection);
        return Ok(());
    }

    let key = b.next_key();
    let process_id = process.definition.process_id;
    let ready = b.event(
        key,
        instance_value(
            WorkflowInstanceIntent::ElementReady,
            WorkflowInstanceRecord {
                element_id: process_id.clone(),
                process_id,
                version: process.version,
                process_key: process.process_key,
                workflow_instance_key: key,
                scope_key: NO_KEY,
                payload: value.payload.clone(),
            },
        ),
    );
    b.respond(command, ready);
    Ok(())
}

pub(super) fn cancel(b: &mut ResultBuilder<'_>, command: &Record) -> Result<()> {
    let key = command.key;
    let state = b.state();
    let found = state
        .elements
        .get(key)
        .map(|instance| (instance.state, instance.record.clone()))
        .or_else(|| {
            state
                .elements
                .failed_token(key)
                .map(|token| (token.state, token.record.clone()))
        });

    let Some((current, record)) = found else {
        b.reject(
            command,
            Rejection::not_applicable(format!(
                "Expected to cancel a workflow instance with key '{key}', but no such workflow instance was found"
            )),
        );
        return Ok(());
    };
    if !record.is_root() {
        b.reject(
            command,
            Rejection::not_applicable(format!(
                "Expected to cancel a workflow instance with key '{key}', but it is an element of workflow instance '{}'; only workflow instances can be cancelled",
                record.workflow_instance_key
            )),
        );
        return Ok(());
    }
    if current.is_terminating() {
        b.reject(
            command,
            Rejection::not_applicable(format!(
                "Expected to cancel a workflow instance with key '{key}', but it is already being terminated"
            )),
        );
        return Ok(());
    }

    let record = WorkflowInstanceRecord {
        payload: Payload::empty(),
        ..record
    };
    let canceling = b.event(
        key,
        instance_value(WorkflowInstanceIntent::Canceling, record.clone()),
    );
    b.event(
        key,
        instance_value(WorkflowInstanceIntent::ElementTerminating, record),
    );
    b.respond(command, canceling);
    Ok(())
}

pub(super) fn update_payload(
    b: &mut ResultBuilder<'_>,
    command: &Record,
    value: &WorkflowInstanceRecord,
    max_payload_size: usize,
) -> Result<()> {
    let key = command.key;
    if let Some(rejection) = payload_too_large(&value.payload, max_payload_size) {
        b.reject(command, rejection);
        return Ok(());
    }

    if let Some(instance) = b.state().elements.get(key).cloned() {
        let updated = b.event(
            key,
            instance_value(
                WorkflowInstanceIntent::PayloadUpdated,
                WorkflowInstanceRecord {
                    payload: value.payload.clone(),
                    ..instance.record
                },
            ),
        );
        b.respond(command, updated);
        return Ok(());
    }

    if let Some(token) = b.state().elements.failed_token(key).cloned() {
        // fix and retry: update the stuck record, resolve its incident and
        // re-enter the state it failed in
        let record = WorkflowInstanceRecord {
            payload: value.payload.clone(),
            ..token.record
        };
        let updated = b.event(
            key,
            instance_value(WorkflowInstanceIntent::PayloadUpdated, record.clone()),
        );
        b.event(
            token.incident_key,
            RecordValue::Incident {
                intent: IncidentIntent::Resolved,
                value: token.incident,
            },
        );
        b.event(key, instance_value(token.state, record));
        b.respond(command, updated);
        return Ok(());
    }

    b.reject(
        command,
        Rejection::not_applicable(format!(
            "Expected to update the payload of element instance '{key}', but workflow instance is not running"
        )),
    );
    Ok(())
}

// ============================================================================
// Token flow
// ============================================================================

pub(super) fn process_event(
    b: &mut ResultBuilder<'_>,
    key: i64,
    intent: WorkflowInstanceIntent,
    value: &WorkflowInstanceRecord,
) -> Result<()> {
    match intent {
        WorkflowInstanceIntent::ElementReady => element_ready(b, key),
        WorkflowInstanceIntent::ElementActivated => element_activated(b, key),
        WorkflowInstanceIntent::StartEventOccurred => {
            take_sequence_flow(b, value.scope_key, &value.element_id, &value.payload)
        }
        WorkflowInstanceIntent::EndEventOccurred => end_event_occurred(b, value),
        WorkflowInstanceIntent::ElementCompleting => element_completing(b, key),
        WorkflowInstanceIntent::ElementCompleted if !value.is_root() => {
            take_sequence_flow(b, value.scope_key, &value.element_id, &value.payload)
        }
        WorkflowInstanceIntent::ElementTerminating => element_terminating(b, key),
        _ => Ok(()),
    }
}

/// Instance `key`, if it is still in `state`.
fn instance_in(b: &ResultBuilder<'_>, key: i64, state: WorkflowInstanceIntent) -> Option<ElementInstance> {
    b.state()
        .elements
        .get(key)
        .filter(|instance| instance.state == state)
        .cloned()
}

/// Scope `key`, if it is still running.
fn active_scope(b: &ResultBuilder<'_>, key: i64) -> Option<ElementInstance> {
    instance_in(b, key, WorkflowInstanceIntent::ElementActivated)
}

fn process_of(b: &ResultBuilder<'_>, instance: &ElementInstance) -> Result<DeployedProcess> {
    b.state()
        .processes
        .by_key(instance.record.process_key)
        .cloned()
        .ok_or_else(|| CoreError::Fatal {
            key: instance.key,
            reason: format!(
                "process with key '{}' is not deployed",
                instance.record.process_key
            ),
        })
}

fn element_ready(b: &mut ResultBuilder<'_>, key: i64) -> Result<()> {
    let Some(instance) = instance_in(b, key, WorkflowInstanceIntent::ElementReady) else {
        return Ok(());
    };
    if !instance.is_root() && active_scope(b, instance.parent_key).is_none() {
        debug!(key, "Scope no longer active, not activating element");
        return Ok(());
    }
    b.event(
        key,
        instance_value(WorkflowInstanceIntent::ElementActivated, instance.record),
    );
    Ok(())
}

/// Asks the partition the correlation key hashes to for a message
/// subscription.
pub(super) fn open_request(
    partition_id: u16,
    subscription: &WorkflowInstanceSubscriptionRecord,
) -> SubscriptionRequest {
    SubscriptionRequest::new(OpenMessageSubscription {
        address: SubscriptionAddress {
            subscription_partition_id: NULL_PARTITION_ID,
            workflow_instance_partition_id: partition_id,
            workflow_instance_key: subscription.workflow_instance_key,
            activity_instance_key: subscription.activity_instance_key,
        },
        message_name: subscription.message_name.clone(),
        correlation_key: subscription.correlation_key.clone(),
    })
    .hashed_by(subscription.correlation_key.clone())
}

fn element_activated(b: &mut ResultBuilder<'_>, key: i64) -> Result<()> {
    let Some(instance) = active_scope(b, key) else {
        return Ok(());
    };

    if instance.is_root() {
        process_of(b, &instance)?;
        let deferred = b
            .state()
            .elements
            .deferred(key, WorkflowInstanceIntent::StartEventOccurred)
            .cloned()
            .ok_or_else(|| CoreError::Fatal {
                key,
                reason: "no start event is deferred for the workflow instance".to_string(),
            })?;
        let start_key = b.next_key();
        b.event(start_key, instance_value(deferred.intent, deferred.record));
        return Ok(());
    }

    if active_scope(b, instance.parent_key).is_none() {
        return Ok(());
    }
    let process = process_of(b, &instance)?;
    let Some(FlowElement::MessageCatch {
        message_name,
        correlation_key,
        ..
    }) = process.definition.element(&instance.record.element_id).cloned()
    else {
        return Err(CoreError::Fatal {
            key,
            reason: format!(
                "element '{}' is not a message catch event",
                instance.record.element_id
            ),
        });
    };

    let correlation_value = match instance.record.payload.get(&correlation_key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(CoreError::UnresolvedVariable {
                key,
                variable: correlation_key,
            });
        }
    };
    for text in [&message_name, &correlation_value] {
        if text.len() > MAX_STRING_LENGTH {
            return Err(CoreError::Fatal {
                key,
                reason: format!(
                    "subscription value of {} bytes exceeds the maximum of {MAX_STRING_LENGTH} bytes",
                    text.len()
                ),
            });
        }
    }

    let subscription = WorkflowInstanceSubscriptionRecord {
        subscription_partition_id: NULL_PARTITION_ID,
        workflow_instance_key: instance.record.workflow_instance_key,
        activity_instance_key: key,
        message_name,
        correlation_key: correlation_value,
        payload: Payload::empty(),
    };
    b.side_effect(open_request(b.partition_id(), &subscription));
    b.event(
        key,
        RecordValue::WorkflowInstanceSubscription {
            intent: WorkflowInstanceSubscriptionIntent::Opening,
            value: subscription,
        },
    );
    Ok(())
}

/// Leave `element_id` inside `scope_key` and enter whatever follows it.
fn take_sequence_flow(
    b: &mut ResultBuilder<'_>,
    scope_key: i64,
    element_id: &str,
    payload: &Payload,
) -> Result<()> {
    let Some(scope) = active_scope(b, scope_key) else {
        return Ok(());
    };
    let process = process_of(b, &scope)?;
    let next = process
        .definition
        .next_after(element_id)
        .ok_or_else(|| CoreError::Fatal {
            key: scope_key,
            reason: format!("element '{element_id}' has no outgoing sequence flow"),
        })?;

    let intent = match next {
        FlowElement::MessageCatch { .. } => WorkflowInstanceIntent::ElementReady,
        FlowElement::EndEvent { .. } => WorkflowInstanceIntent::EndEventOccurred,
        FlowElement::StartEvent { id } => {
            return Err(CoreError::Fatal {
                key: scope_key,
                reason: format!("sequence flow leads back to start event '{id}'"),
            });
        }
    };
    let key = b.next_key();
    b.event(
        key,
        instance_value(
            intent,
            WorkflowInstanceRecord {
                element_id: next.id().to_string(),
                scope_key,
                payload: payload.clone(),
                ..scope.record
            },
        ),
    );
    Ok(())
}

fn end_event_occurred(b: &mut ResultBuilder<'_>, value: &WorkflowInstanceRecord) -> Result<()> {
    let Some(scope) = active_scope(b, value.scope_key) else {
        return Ok(());
    };
    b.event(
        scope.key,
        instance_value(
            WorkflowInstanceIntent::ElementCompleting,
            WorkflowInstanceRecord {
                payload: value.payload.clone(),
                ..scope.record
            },
        ),
    );
    Ok(())
}

fn element_completing(b: &mut ResultBuilder<'_>, key: i64) -> Result<()> {
    let Some(instance) = instance_in(b, key, WorkflowInstanceIntent::ElementCompleting) else {
        return Ok(());
    };
    b.event(
        key,
        instance_value(WorkflowInstanceIntent::ElementCompleted, instance.record),
    );
    Ok(())
}

/// Terminate the children of a terminating scope, close their
/// subscriptions, then terminate the scope itself.
fn element_terminating(b: &mut ResultBuilder<'_>, key: i64) -> Result<()> {
    let Some(instance) = instance_in(b, key, WorkflowInstanceIntent::ElementTerminating) else {
        return Ok(());
    };
    let partition_id = b.partition_id();

    let children: Vec<ElementInstance> = b.state().elements.children(key).cloned().collect();
    for child in children {
        let subscriptions: Vec<WorkflowInstanceSubscriptionRecord> = b
            .state()
            .subscriptions
            .of_element(child.key)
            .map(|subscription| subscription.record.clone())
            .collect();
        for subscription in subscriptions {
            b.side_effect(
                SubscriptionRequest::new(CloseMessageSubscription {
                    address: SubscriptionAddress {
                        subscription_partition_id: subscription.subscription_partition_id,
                        workflow_instance_partition_id: partition_id,
                        workflow_instance_key: subscription.workflow_instance_key,
                        activity_instance_key: child.key,
                    },
                    message_name: subscription.message_name.clone(),
                })
                .hashed_by(subscription.correlation_key.clone()),
            );
            b.event(
                child.key,
                RecordValue::WorkflowInstanceSubscription {
                    intent: WorkflowInstanceSubscriptionIntent::Closed,
                    value: subscription,
                },
            );
        }
        b.event(
            child.key,
            instance_value(WorkflowInstanceIntent::ElementTerminated, child.record),
        );
    }

    let tokens: Vec<_> = b
        .state()
        .elements
        .failed_tokens_in_scope(key)
        .cloned()
        .collect();
    for token in tokens {
        b.event(
            token.incident_key,
            RecordValue::Incident {
                intent: IncidentIntent::Resolved,
                value: token.incident,
            },
        );
        b.event(
            token.key,
            instance_value(WorkflowInstanceIntent::ElementTerminated, token.record),
        );
    }
    // a cancelled root may itself be a failed token
    if let Some(token) = b.state().elements.failed_token(key).cloned() {
        b.event(
            token.incident_key,
            RecordValue::Incident {
                intent: IncidentIntent::Resolved,
                value: token.incident,
            },
        );
    }

    b.event(
        key,
        instance_value(WorkflowInstanceIntent::ElementTerminated, instance.record),
    );
    Ok(())
}
