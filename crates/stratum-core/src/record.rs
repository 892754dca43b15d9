// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Records written to a partition log.
//!
//! A [`Record`] is either a command (a request to change state), an event (a
//! state change that happened) or a command rejection. Its value is one of
//! the [`RecordValue`] variants, each pairing an intent with a typed value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Rejection;

/// Key value meaning "no key" (root scope, unset process key, ...).
pub const NO_KEY: i64 = -1;

/// Version value meaning "latest deployed version".
pub const LATEST_VERSION: i32 = -1;

const KEY_PARTITION_SHIFT: u32 = 51;
const KEY_COUNTER_MASK: i64 = (1 << KEY_PARTITION_SHIFT) - 1;

/// Encode a partition-local counter into a cluster-unique key.
pub fn encode_key(partition_id: u16, counter: i64) -> i64 {
    ((partition_id as i64) << KEY_PARTITION_SHIFT) | (counter & KEY_COUNTER_MASK)
}

/// Partition that generated `key`.
pub fn key_partition(key: i64) -> u16 {
    (key >> KEY_PARTITION_SHIFT) as u16
}

/// Partition-local counter part of `key`.
pub fn key_counter(key: i64) -> i64 {
    key & KEY_COUNTER_MASK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

/// Identifies the connection a command came from, so its response can be
/// routed back. Processing logic never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub request_id: u64,
    pub stream_id: u32,
}

/// Variables document attached to workflow instances and messages.
///
/// The empty document is the "no payload" value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    /// Copy every top-level variable of `other` into this document.
    pub fn merge(&mut self, other: &Payload) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        if self.is_empty() {
            return Vec::new();
        }
        Value::Object(self.0.clone()).to_string().into_bytes()
    }

    /// Size of the encoded document in bytes.
    pub fn encoded_len(&self) -> usize {
        self.to_bytes().len()
    }

    /// Parse a document. Empty input is the empty payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        serde_json::from_slice(bytes)
    }
}

impl TryFrom<Value> for Payload {
    type Error = Value;

    /// Only JSON objects are valid payloads; anything else is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::empty()),
            other => Err(other),
        }
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ============================================================================
// Intents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentIntent {
    Create,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowInstanceIntent {
    // commands
    Create,
    Cancel,
    UpdatePayload,
    // events
    ElementReady,
    ElementActivated,
    ElementCompleting,
    ElementCompleted,
    ElementTerminating,
    ElementTerminated,
    StartEventOccurred,
    EndEventOccurred,
    Canceling,
    PayloadUpdated,
}

impl WorkflowInstanceIntent {
    /// Whether an element in this state has reached the end of its lifecycle.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::ElementCompleted | Self::ElementTerminated)
    }

    /// Whether an element in this state is on its way out.
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::ElementTerminating | Self::ElementTerminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageIntent {
    Publish,
    Published,
    /// Drop buffered messages whose deadline passed.
    Expire,
    Deleted,
}

/// Intents of the subscription kept on the message's partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSubscriptionIntent {
    Open,
    Opened,
    Correlate,
    Correlating,
    Correlated,
    Close,
    Closed,
}

/// Intents of the subscription kept on the workflow instance's partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowInstanceSubscriptionIntent {
    Opening,
    Open,
    Opened,
    Correlate,
    Correlated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentIntent {
    Created,
    Resolved,
}

// ============================================================================
// Process definitions
// ============================================================================

/// One node of a (sequential) process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowElement {
    StartEvent {
        id: String,
    },
    /// Waits for a message; `correlation_key` names the payload variable
    /// holding the correlation value.
    MessageCatch {
        id: String,
        message_name: String,
        correlation_key: String,
    },
    EndEvent {
        id: String,
    },
}

impl FlowElement {
    pub fn id(&self) -> &str {
        match self {
            Self::StartEvent { id } | Self::MessageCatch { id, .. } | Self::EndEvent { id } => id,
        }
    }
}

/// A parsed process model. Elements run in order from the start event to the
/// end event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub process_id: String,
    pub elements: Vec<FlowElement>,
}

impl ProcessDefinition {
    pub fn start_event(&self) -> Option<&FlowElement> {
        self.elements
            .first()
            .filter(|e| matches!(e, FlowElement::StartEvent { .. }))
    }

    pub fn element(&self, id: &str) -> Option<&FlowElement> {
        self.elements.iter().find(|e| e.id() == id)
    }

    /// Element reached by leaving `id` through its outgoing sequence flow.
    pub fn next_after(&self, id: &str) -> Option<&FlowElement> {
        let index = self.elements.iter().position(|e| e.id() == id)?;
        self.elements.get(index + 1)
    }

    /// Describe why this definition cannot be deployed, if it cannot.
    pub fn validate(&self) -> Result<(), String> {
        if self.process_id.is_empty() {
            return Err("process id must not be empty".to_string());
        }
        if self.start_event().is_none() {
            return Err(format!(
                "process '{}' must begin with a start event",
                self.process_id
            ));
        }
        if !matches!(self.elements.last(), Some(FlowElement::EndEvent { .. })) {
            return Err(format!(
                "process '{}' must finish with an end event",
                self.process_id
            ));
        }
        let inner = &self.elements[1..self.elements.len() - 1];
        if let Some(element) = inner
            .iter()
            .find(|e| !matches!(e, FlowElement::MessageCatch { .. }))
        {
            return Err(format!(
                "element '{}' of process '{}' is not a message catch event",
                element.id(),
                self.process_id
            ));
        }
        let mut ids: Vec<&str> = self.elements.iter().map(FlowElement::id).collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(format!(
                "element id '{}' is used more than once in process '{}'",
                pair[0], self.process_id
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Record values
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedProcess {
    pub process_key: i64,
    pub version: i32,
    pub definition: ProcessDefinition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub processes: Vec<DeployedProcess>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstanceRecord {
    pub process_id: String,
    pub version: i32,
    pub process_key: i64,
    pub workflow_instance_key: i64,
    pub element_id: String,
    /// Key of the enclosing scope, `NO_KEY` for the workflow instance itself.
    pub scope_key: i64,
    pub payload: Payload,
}

impl Default for WorkflowInstanceRecord {
    fn default() -> Self {
        Self {
            process_id: String::new(),
            version: LATEST_VERSION,
            process_key: NO_KEY,
            workflow_instance_key: NO_KEY,
            element_id: String::new(),
            scope_key: NO_KEY,
            payload: Payload::empty(),
        }
    }
}

impl WorkflowInstanceRecord {
    pub fn is_root(&self) -> bool {
        self.scope_key < 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub name: String,
    pub correlation_key: String,
    /// Optional client id making the publish idempotent while buffered.
    #[serde(default)]
    pub message_id: String,
    /// How long the message stays buffered, in milliseconds.
    pub time_to_live: i64,
    /// Epoch milliseconds after which a buffered message is deleted. On an
    /// expire command, the current time.
    #[serde(default)]
    pub deadline: i64,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSubscriptionRecord {
    pub workflow_instance_partition_id: u16,
    pub workflow_instance_key: i64,
    pub activity_instance_key: i64,
    pub message_name: String,
    pub correlation_key: String,
    /// Key of the message correlated to this subscription, if any.
    pub message_key: i64,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstanceSubscriptionRecord {
    pub subscription_partition_id: u16,
    pub workflow_instance_key: i64,
    pub activity_instance_key: i64,
    pub message_name: String,
    pub correlation_key: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub error_type: String,
    pub error_message: String,
    pub workflow_instance_key: i64,
    pub element_instance_key: i64,
    pub element_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "value_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordValue {
    Deployment {
        intent: DeploymentIntent,
        value: DeploymentRecord,
    },
    WorkflowInstance {
        intent: WorkflowInstanceIntent,
        value: WorkflowInstanceRecord,
    },
    Message {
        intent: MessageIntent,
        value: MessageRecord,
    },
    MessageSubscription {
        intent: MessageSubscriptionIntent,
        value: MessageSubscriptionRecord,
    },
    WorkflowInstanceSubscription {
        intent: WorkflowInstanceSubscriptionIntent,
        value: WorkflowInstanceSubscriptionRecord,
    },
    Incident {
        intent: IncidentIntent,
        value: IncidentRecord,
    },
}

impl RecordValue {
    /// Intent name for logs, e.g. `ELEMENT_ACTIVATED`.
    pub fn intent_name(&self) -> String {
        let intent = match self {
            Self::Deployment { intent, .. } => serde_json::to_value(intent),
            Self::WorkflowInstance { intent, .. } => serde_json::to_value(intent),
            Self::Message { intent, .. } => serde_json::to_value(intent),
            Self::MessageSubscription { intent, .. } => serde_json::to_value(intent),
            Self::WorkflowInstanceSubscription { intent, .. } => serde_json::to_value(intent),
            Self::Incident { intent, .. } => serde_json::to_value(intent),
        };
        match intent {
            Ok(Value::String(name)) => name,
            _ => String::from("UNKNOWN"),
        }
    }
}

/// One entry of the partition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub record_type: RecordType,
    pub key: i64,
    pub value: RecordValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestMetadata>,
}

impl Record {
    pub fn command(key: i64, value: RecordValue) -> Self {
        Self {
            record_type: RecordType::Command,
            key,
            value,
            rejection: None,
            request: None,
        }
    }

    pub fn event(key: i64, value: RecordValue) -> Self {
        Self {
            record_type: RecordType::Event,
            key,
            value,
            rejection: None,
            request: None,
        }
    }

    /// Rejection of `command`, keeping its key, value and request metadata.
    pub fn rejection(command: &Record, rejection: Rejection) -> Self {
        Self {
            record_type: RecordType::CommandRejection,
            key: command.key,
            value: command.value.clone(),
            rejection: Some(rejection),
            request: command.request,
        }
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }

    pub fn workflow_instance(&self) -> Option<(WorkflowInstanceIntent, &WorkflowInstanceRecord)> {
        match &self.value {
            RecordValue::WorkflowInstance { intent, value } => Some((*intent, value)),
            _ => None,
        }
    }
}

/// Build the command creating a workflow instance.
///
/// Resolution order: `process_key` when set, else `process_id` with
/// `version`, else the latest version of `process_id`.
pub fn create_workflow_instance(
    process_id: impl Into<String>,
    version: i32,
    process_key: i64,
    payload: Payload,
) -> Record {
    Record::command(
        NO_KEY,
        RecordValue::WorkflowInstance {
            intent: WorkflowInstanceIntent::Create,
            value: WorkflowInstanceRecord {
                process_id: process_id.into(),
                version,
                process_key,
                payload,
                ..Default::default()
            },
        },
    )
}

pub fn cancel_workflow_instance(workflow_instance_key: i64) -> Record {
    Record::command(
        workflow_instance_key,
        RecordValue::WorkflowInstance {
            intent: WorkflowInstanceIntent::Cancel,
            value: WorkflowInstanceRecord {
                workflow_instance_key,
                ..Default::default()
            },
        },
    )
}

pub fn update_payload(element_instance_key: i64, payload: Payload) -> Record {
    Record::command(
        element_instance_key,
        RecordValue::WorkflowInstance {
            intent: WorkflowInstanceIntent::UpdatePayload,
            value: WorkflowInstanceRecord {
                payload,
                ..Default::default()
            },
        },
    )
}

pub fn deploy(definitions: Vec<ProcessDefinition>) -> Record {
    Record::command(
        NO_KEY,
        RecordValue::Deployment {
            intent: DeploymentIntent::Create,
            value: DeploymentRecord {
                processes: definitions
                    .into_iter()
                    .map(|definition| DeployedProcess {
                        process_key: NO_KEY,
                        version: LATEST_VERSION,
                        definition,
                    })
                    .collect(),
            },
        },
    )
}

pub fn publish_message(
    name: impl Into<String>,
    correlation_key: impl Into<String>,
    message_id: impl Into<String>,
    time_to_live: i64,
    payload: Payload,
) -> Record {
    let deadline = if time_to_live > 0 {
        chrono::Utc::now()
            .timestamp_millis()
            .saturating_add(time_to_live)
    } else {
        0
    };
    Record::command(
        NO_KEY,
        RecordValue::Message {
            intent: MessageIntent::Publish,
            value: MessageRecord {
                name: name.into(),
                correlation_key: correlation_key.into(),
                message_id: message_id.into(),
                time_to_live,
                deadline,
                payload,
            },
        },
    )
}

/// Delete the buffered messages whose deadline is at or before `now`
/// (epoch milliseconds).
pub fn expire_messages(now: i64) -> Record {
    Record::command(
        NO_KEY,
        RecordValue::Message {
            intent: MessageIntent::Expire,
            value: MessageRecord {
                name: String::new(),
                correlation_key: String::new(),
                message_id: String::new(),
                time_to_live: 0,
                deadline: now,
                payload: Payload::empty(),
            },
        },
    )
}
