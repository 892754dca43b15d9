// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use super::handle::{PartitionRequest, Responder};
use super::{
    PartitionError, PartitionHandle, PartitionOptions, PartitionPositions, READ_BATCH_SIZE,
    Recovered,
};
use crate::correlation::{Delivery, SendError, SubscriptionCommandSender, SubscriptionRequest};
use crate::persistence::{LogEntry, PartitionLog, PartitionSnapshot, SnapshotStore};
use crate::processing::{ProcessingResult, StreamProcessor};
use crate::record::{Record, RequestMetadata};
use crate::state::PartitionState;

pub(super) fn spawn(
    options: PartitionOptions,
    log: PartitionLog,
    snapshots: SnapshotStore,
    sender: Arc<SubscriptionCommandSender>,
    recovered: Recovered,
) -> PartitionHandle {
    let partition_id = options.partition_id;
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (positions_tx, positions_rx) = watch::channel(PartitionPositions {
        first: recovered.bounds.first,
        commit: recovered.bounds.commit,
        processed: recovered.processed_position,
        exporter: 0,
        snapshot: recovered.snapshot_position,
    });

    let processor = StreamProcessor::new(partition_id, options.max_payload_size);
    // messages queued before the last stop were not persisted
    let pending_sends: VecDeque<SubscriptionRequest> =
        processor.unconfirmed_requests(&recovered.state).into();

    let actor = PartitionActor {
        partition_id,
        processor,
        state: recovered.state,
        log: log.clone(),
        snapshots: snapshots.clone(),
        sender,
        snapshot_chunk_size: options.snapshot_chunk_size,
        processed_position: recovered.processed_position,
        exporter_position: 0,
        snapshot_position: recovered.snapshot_position,
        next_request_id: 0,
        pending_responses: HashMap::new(),
        ready_responses: Vec::new(),
        pending_sends,
        positions: positions_tx,
    };
    tokio::spawn(actor.run(requests_rx));

    PartitionHandle {
        partition_id,
        requests: requests_tx,
        leader: Arc::new(AtomicBool::new(true)),
        positions: positions_rx,
        log,
        snapshots,
    }
}

struct PartitionActor {
    partition_id: u16,
    processor: StreamProcessor,
    state: PartitionState,
    log: PartitionLog,
    snapshots: SnapshotStore,
    sender: Arc<SubscriptionCommandSender>,
    snapshot_chunk_size: usize,
    processed_position: u64,
    exporter_position: u64,
    snapshot_position: Option<u64>,
    next_request_id: u64,
    pending_responses: HashMap<u64, Responder>,
    /// Answered after the positions covering them are published.
    ready_responses: Vec<(Responder, Result<Record, PartitionError>)>,
    pending_sends: VecDeque<SubscriptionRequest>,
    positions: watch::Sender<PartitionPositions>,
}

impl PartitionActor {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<PartitionRequest>) {
        let partition_id = self.partition_id;
        if let Err(e) = self.process_pending().await {
            error!(partition_id, error = %e, "Partition failed while resuming processing");
            return;
        }
        if !self.pending_sends.is_empty() {
            let resent = self.pending_sends.len();
            let pending = self.retry_pending_sends().await;
            info!(partition_id, resent, pending, "Resent unconfirmed subscription messages");
        }
        info!(partition_id, "Partition started");

        while let Some(request) = requests.recv().await {
            if let PartitionRequest::Shutdown { reply } = request {
                self.drain(&mut requests).await;
                info!(partition_id, pending_sends = self.pending_sends.len(), "Partition stopped");
                let _ = reply.send(());
                return;
            }
            if let Err(e) = self.handle(request).await {
                error!(partition_id, error = %e, "Partition stopped after a log failure");
                return;
            }
        }
        info!(partition_id, "Partition handle dropped, stopping");
    }

    /// Serve what was queued before a shutdown request and refuse the rest.
    async fn drain(&mut self, requests: &mut mpsc::UnboundedReceiver<PartitionRequest>) {
        requests.close();
        while let Some(request) = requests.recv().await {
            if let Err(e) = self.handle(request).await {
                error!(partition_id = self.partition_id, error = %e, "Failed to drain partition queue");
                return;
            }
        }
    }

    async fn handle(&mut self, request: PartitionRequest) -> Result<(), PartitionError> {
        match request {
            PartitionRequest::Append { record, responder } => {
                self.append(record, responder).await?;
            }
            PartitionRequest::TakeSnapshot { reply } => {
                let _ = reply.send(self.take_snapshot().await);
            }
            PartitionRequest::SetExporterPosition { position, reply } => {
                let _ = reply.send(self.set_exporter_position(position).await);
            }
            PartitionRequest::RetryPendingSends { reply } => {
                let _ = reply.send(self.retry_pending_sends().await);
            }
            PartitionRequest::InspectState { reply } => {
                let _ = reply.send(self.state.clone());
            }
            // only seen while draining
            PartitionRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
        Ok(())
    }

    async fn append(
        &mut self,
        mut record: Record,
        responder: Option<Responder>,
    ) -> Result<(), PartitionError> {
        if let Some(responder) = responder {
            self.next_request_id += 1;
            let request_id = self.next_request_id;
            record.request = Some(RequestMetadata {
                request_id,
                stream_id: 0,
            });
            self.pending_responses.insert(request_id, responder);
        }
        self.log.append(None, vec![record]).await?;
        self.process_pending().await
    }

    /// Process every committed record after the processed position.
    async fn process_pending(&mut self) -> Result<(), PartitionError> {
        loop {
            let bounds = self.log.bounds().await?;
            if self.processed_position >= bounds.commit {
                break;
            }
            let entries = self
                .log
                .read(self.processed_position + 1, READ_BATCH_SIZE)
                .await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                if entry.position > bounds.commit {
                    break;
                }
                self.process_entry(entry).await?;
            }
        }
        self.publish_positions().await?;
        for (responder, response) in self.ready_responses.drain(..) {
            let _ = responder.send(response);
        }
        Ok(())
    }

    async fn process_entry(&mut self, entry: LogEntry) -> Result<(), PartitionError> {
        let ProcessingResult {
            records,
            side_effects,
            response,
        } = self.processor.process(&mut self.state, &entry.record);

        self.log.append(Some(entry.position), records).await?;
        self.processed_position = entry.position;

        if let Some(metadata) = entry.record.request
            && let Some(responder) = self.pending_responses.remove(&metadata.request_id)
        {
            let response = response.ok_or(PartitionError::NoResponse(entry.position));
            self.ready_responses.push((responder, response));
        }

        for request in side_effects {
            self.send(request).await;
        }
        Ok(())
    }

    async fn send(&mut self, request: SubscriptionRequest) {
        match self.sender.send(&request).await {
            Ok(Delivery::Delivered) | Ok(Delivery::Dropped) => {}
            Ok(Delivery::Pending) => {
                debug!(partition_id = self.partition_id, "Subscription message pending");
                self.pending_sends.push_back(request);
            }
            Err(SendError::Unroutable(name)) => {
                warn!(partition_id = self.partition_id, message_name = %name, "Discarding unroutable subscription message");
            }
            Err(SendError::Encode(e)) => {
                warn!(partition_id = self.partition_id, error = %e, "Discarding unencodable subscription message");
            }
            Err(e) => {
                warn!(partition_id = self.partition_id, error = %e, "Subscription message not sent, will retry");
                self.pending_sends.push_back(request);
            }
        }
    }

    async fn retry_pending_sends(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_sends);
        for request in pending {
            self.send(request).await;
        }
        self.pending_sends.len()
    }

    #[instrument(skip(self), fields(partition_id = self.partition_id))]
    async fn take_snapshot(&mut self) -> Result<Option<u64>, PartitionError> {
        self.process_pending().await?;
        let bounds = self.log.bounds().await?;
        let position = bounds.commit;
        if position == 0
            || self.processed_position < position
            || self.snapshot_position == Some(position)
        {
            return Ok(self.snapshot_position);
        }

        let snapshot = PartitionSnapshot {
            position,
            processed_position: self.processed_position,
            state: self.state.clone(),
        };
        let content = snapshot.to_bytes()?;
        let metadata = self
            .snapshots
            .persist(position, &content, self.snapshot_chunk_size)
            .await?;
        self.snapshot_position = Some(position);
        info!(position, chunks = metadata.chunk_count(), "Snapshot taken");

        self.compact().await?;
        self.snapshots.purge_older_than(position).await?;
        self.publish_positions().await?;
        Ok(Some(position))
    }

    async fn set_exporter_position(&mut self, position: u64) -> Result<(), PartitionError> {
        let commit = self.log.bounds().await?.commit;
        self.exporter_position = self.exporter_position.max(position.min(commit));
        self.compact().await?;
        self.publish_positions().await
    }

    /// Drop log entries covered by both the snapshot and the exporter.
    async fn compact(&mut self) -> Result<(), PartitionError> {
        let Some(snapshot_position) = self.snapshot_position else {
            return Ok(());
        };
        let up_to = snapshot_position.min(self.exporter_position);
        if up_to >= self.log.bounds().await?.first {
            self.log.store().compact(up_to).await?;
            debug!(partition_id = self.partition_id, up_to, "Log compacted");
        }
        Ok(())
    }

    async fn publish_positions(&mut self) -> Result<(), PartitionError> {
        let bounds = self.log.bounds().await?;
        self.positions.send_replace(PartitionPositions {
            first: bounds.first,
            commit: bounds.commit,
            processed: self.processed_position,
            exporter: self.exporter_position,
            snapshot: self.snapshot_position,
        });
        Ok(())
    }
}
