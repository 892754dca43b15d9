// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Running element instances plus their deferred records and failed tokens.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::{IncidentRecord, WorkflowInstanceIntent, WorkflowInstanceRecord};

/// One running scope: a workflow instance or an element inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInstance {
    pub key: i64,
    /// Key of the enclosing scope, negative for a workflow instance.
    pub parent_key: i64,
    pub state: WorkflowInstanceIntent,
    pub record: WorkflowInstanceRecord,
}

impl ElementInstance {
    pub fn is_root(&self) -> bool {
        self.parent_key < 0
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkflowInstanceIntent::ElementActivated
    }
}

/// A record queued against a scope until that scope is ready for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRecord {
    pub intent: WorkflowInstanceIntent,
    pub record: WorkflowInstanceRecord,
}

/// An element whose activation failed; kept until its payload is fixed or
/// its workflow instance is terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedToken {
    pub key: i64,
    pub incident_key: i64,
    pub incident: IncidentRecord,
    pub state: WorkflowInstanceIntent,
    pub record: WorkflowInstanceRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInstanceState {
    instances: BTreeMap<i64, ElementInstance>,
    /// scope key -> records waiting for that scope
    deferred: BTreeMap<i64, Vec<DeferredRecord>>,
    failed_tokens: BTreeMap<i64, FailedToken>,
}

impl ElementInstanceState {
    pub fn get(&self, key: i64) -> Option<&ElementInstance> {
        self.instances.get(&key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Live instances whose parent is `scope_key`, in key order.
    pub fn children(&self, scope_key: i64) -> impl Iterator<Item = &ElementInstance> {
        self.instances
            .values()
            .filter(move |instance| instance.parent_key == scope_key)
    }

    /// Create or move an instance to `state`.
    pub fn transition(
        &mut self,
        key: i64,
        state: WorkflowInstanceIntent,
        record: &WorkflowInstanceRecord,
    ) {
        self.instances
            .entry(key)
            .and_modify(|instance| {
                instance.state = state;
                instance.record = record.clone();
            })
            .or_insert_with(|| ElementInstance {
                key,
                parent_key: record.scope_key,
                state,
                record: record.clone(),
            });
    }

    /// Drop an instance that reached a final state, with everything queued on it.
    pub fn remove(&mut self, key: i64) -> Option<ElementInstance> {
        self.deferred.remove(&key);
        self.failed_tokens.remove(&key);
        self.instances.remove(&key)
    }

    pub fn set_payload(&mut self, key: i64, record: &WorkflowInstanceRecord) -> bool {
        if let Some(instance) = self.instances.get_mut(&key) {
            instance.record.payload = record.payload.clone();
            return true;
        }
        if let Some(token) = self.failed_tokens.get_mut(&key) {
            token.record.payload = record.payload.clone();
            return true;
        }
        false
    }

    pub fn defer(&mut self, scope_key: i64, deferred: DeferredRecord) {
        self.deferred.entry(scope_key).or_default().push(deferred);
    }

    /// First record deferred against `scope_key` with `intent`.
    pub fn deferred(
        &self,
        scope_key: i64,
        intent: WorkflowInstanceIntent,
    ) -> Option<&DeferredRecord> {
        self.deferred
            .get(&scope_key)?
            .iter()
            .find(|deferred| deferred.intent == intent)
    }

    /// Consume the first record deferred against `scope_key` with `intent`.
    pub fn consume_deferred(&mut self, scope_key: i64, intent: WorkflowInstanceIntent) {
        if let Some(records) = self.deferred.get_mut(&scope_key) {
            if let Some(index) = records.iter().position(|d| d.intent == intent) {
                records.remove(index);
            }
            if records.is_empty() {
                self.deferred.remove(&scope_key);
            }
        }
    }

    /// Move the instance an incident was raised on to the failed token table.
    pub fn fail(&mut self, incident_key: i64, incident: &IncidentRecord) {
        let key = incident.element_instance_key;
        if let Some(instance) = self.instances.remove(&key) {
            self.failed_tokens.insert(
                key,
                FailedToken {
                    key,
                    incident_key,
                    incident: incident.clone(),
                    state: instance.state,
                    record: instance.record,
                },
            );
        }
    }

    pub fn failed_token(&self, key: i64) -> Option<&FailedToken> {
        self.failed_tokens.get(&key)
    }

    /// Failed tokens belonging to `scope_key`, in key order.
    pub fn failed_tokens_in_scope(&self, scope_key: i64) -> impl Iterator<Item = &FailedToken> {
        self.failed_tokens
            .values()
            .filter(move |token| token.record.scope_key == scope_key)
    }

    pub fn remove_failed_token(&mut self, key: i64) -> Option<FailedToken> {
        self.failed_tokens.remove(&key)
    }
}
