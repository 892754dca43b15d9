// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot, watch};

use super::{PartitionError, PartitionPositions};
use crate::persistence::{PartitionLog, SnapshotStore};
use crate::record::{
    self, LATEST_VERSION, NO_KEY, Payload, ProcessDefinition, Record,
};
use crate::state::PartitionState;

pub(super) type Responder = oneshot::Sender<Result<Record, PartitionError>>;

/// Requests served by the partition actor, in arrival order.
pub(super) enum PartitionRequest {
    Append {
        record: Record,
        responder: Option<Responder>,
    },
    TakeSnapshot {
        reply: oneshot::Sender<Result<Option<u64>, PartitionError>>,
    },
    SetExporterPosition {
        position: u64,
        reply: oneshot::Sender<Result<(), PartitionError>>,
    },
    RetryPendingSends {
        reply: oneshot::Sender<usize>,
    },
    InspectState {
        reply: oneshot::Sender<PartitionState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running partition.
#[derive(Clone)]
pub struct PartitionHandle {
    pub(super) partition_id: u16,
    pub(super) requests: mpsc::UnboundedSender<PartitionRequest>,
    pub(super) leader: Arc<AtomicBool>,
    pub(super) positions: watch::Receiver<PartitionPositions>,
    pub(super) log: PartitionLog,
    pub(super) snapshots: SnapshotStore,
}

impl std::fmt::Debug for PartitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionHandle")
            .field("partition_id", &self.partition_id)
            .field("leader", &self.is_leader())
            .field("positions", &*self.positions.borrow())
            .finish()
    }
}

impl PartitionHandle {
    pub fn partition_id(&self) -> u16 {
        self.partition_id
    }

    /// Whether this node currently leads the partition.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }

    pub fn log(&self) -> &PartitionLog {
        &self.log
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    fn send(&self, request: PartitionRequest) -> Result<(), PartitionError> {
        self.requests
            .send(request)
            .map_err(|_| PartitionError::Closed(self.partition_id))
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> PartitionRequest,
    ) -> Result<T, PartitionError> {
        let (reply, response) = oneshot::channel();
        self.send(request(reply))?;
        response
            .await
            .map_err(|_| PartitionError::Closed(self.partition_id))
    }

    /// Queue a command without waiting for it to be processed.
    pub fn append_command(&self, record: Record) -> Result<(), PartitionError> {
        self.send(PartitionRequest::Append {
            record,
            responder: None,
        })
    }

    /// Write a command and wait for the event or rejection answering it.
    pub async fn execute(&self, record: Record) -> Result<Record, PartitionError> {
        self.call(|responder| PartitionRequest::Append {
            record,
            responder: Some(responder),
        })
        .await?
    }

    pub async fn deploy(&self, definitions: Vec<ProcessDefinition>) -> Result<Record, PartitionError> {
        self.execute(record::deploy(definitions)).await
    }

    /// Create an instance of the latest version of `process_id`.
    pub async fn create_workflow_instance(
        &self,
        process_id: &str,
        payload: Payload,
    ) -> Result<Record, PartitionError> {
        self.execute(record::create_workflow_instance(
            process_id,
            LATEST_VERSION,
            NO_KEY,
            payload,
        ))
        .await
    }

    pub async fn cancel_workflow_instance(&self, key: i64) -> Result<Record, PartitionError> {
        self.execute(record::cancel_workflow_instance(key)).await
    }

    pub async fn update_payload(&self, key: i64, payload: Payload) -> Result<Record, PartitionError> {
        self.execute(record::update_payload(key, payload)).await
    }

    pub async fn publish_message(
        &self,
        name: &str,
        correlation_key: &str,
        message_id: &str,
        time_to_live: i64,
        payload: Payload,
    ) -> Result<Record, PartitionError> {
        self.execute(record::publish_message(
            name,
            correlation_key,
            message_id,
            time_to_live,
            payload,
        ))
        .await
    }

    /// Snapshot the state at the last processed position and compact the
    /// log. Returns the position of the latest snapshot, if any.
    pub async fn take_snapshot(&self) -> Result<Option<u64>, PartitionError> {
        self.call(|reply| PartitionRequest::TakeSnapshot { reply })
            .await?
    }

    /// Record how far the exporter has read; the log is never compacted
    /// past it.
    pub async fn set_exporter_position(&self, position: u64) -> Result<(), PartitionError> {
        self.call(|reply| PartitionRequest::SetExporterPosition { position, reply })
            .await?
    }

    /// Send the subscription messages that could not be delivered yet.
    /// Returns how many are still waiting.
    pub async fn retry_pending_sends(&self) -> Result<usize, PartitionError> {
        self.call(|reply| PartitionRequest::RetryPendingSends { reply })
            .await
    }

    /// Queue deletion of buffered messages whose deadline is at or before
    /// `now` (epoch milliseconds).
    pub fn expire_messages(&self, now: i64) -> Result<(), PartitionError> {
        self.append_command(record::expire_messages(now))
    }

    /// Copy of the current partition state.
    pub async fn inspect_state(&self) -> Result<PartitionState, PartitionError> {
        self.call(|reply| PartitionRequest::InspectState { reply })
            .await
    }

    pub fn positions(&self) -> PartitionPositions {
        *self.positions.borrow()
    }

    pub fn watch_positions(&self) -> watch::Receiver<PartitionPositions> {
        self.positions.clone()
    }

    /// Stop the actor once every request queued before this call has been
    /// processed.
    pub async fn shutdown(&self) -> Result<(), PartitionError> {
        self.call(|reply| PartitionRequest::Shutdown { reply })
            .await
    }
}
