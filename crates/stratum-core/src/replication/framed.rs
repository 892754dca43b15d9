// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication over a framed byte stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use stratum_protocol::{
    Frame, FrameError, FramedStream, LogBlock, LogBlockRequest, MessageType, ReplicationRequest,
    RestoreInfoRequest, RestoreInfoResponse, SnapshotChunk, SnapshotChunkRequest, WireMessage,
};

use super::{ReplicationError, ReplicationSource};
use crate::correlation::SubscriptionMessageHandler;

/// [`ReplicationSource`] backed by a remote [`ReplicationServer`].
///
/// Requests on one connection are serialized.
pub struct FramedReplicationClient<S> {
    partition_id: u16,
    stream: Mutex<FramedStream<S>>,
}

impl<S> FramedReplicationClient<S> {
    pub fn new(partition_id: u16, stream: S) -> Self {
        Self {
            partition_id,
            stream: Mutex::new(FramedStream::new(stream)),
        }
    }
}

#[async_trait]
impl<S> ReplicationSource for FramedReplicationClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn restore_info(
        &self,
        from_position: u64,
        backup_position: u64,
    ) -> Result<RestoreInfoResponse, ReplicationError> {
        let request = RestoreInfoRequest {
            partition_id: self.partition_id,
            from_position,
            backup_position,
        };
        Ok(self.stream.lock().await.request(&request).await?)
    }

    async fn log_block(
        &self,
        from_position: u64,
        max_entries: u32,
    ) -> Result<LogBlock, ReplicationError> {
        let request = LogBlockRequest {
            partition_id: self.partition_id,
            from_position,
            max_entries,
        };
        Ok(self.stream.lock().await.request(&request).await?)
    }

    async fn snapshot_chunk(
        &self,
        snapshot_position: u64,
        chunk_index: u32,
    ) -> Result<SnapshotChunk, ReplicationError> {
        let request = SnapshotChunkRequest {
            partition_id: self.partition_id,
            snapshot_position,
            chunk_index,
        };
        Ok(self.stream.lock().await.request(&request).await?)
    }
}

/// Answers replication requests for the partitions registered with it and
/// hands subscription messages to the local handler.
#[derive(Default)]
pub struct ReplicationServer {
    sources: RwLock<BTreeMap<u16, Arc<dyn ReplicationSource>>>,
    subscriptions: Option<Arc<SubscriptionMessageHandler>>,
}

impl ReplicationServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also accept subscription messages on replication connections.
    pub fn with_subscriptions(mut self, handler: Arc<SubscriptionMessageHandler>) -> Self {
        self.subscriptions = Some(handler);
        self
    }

    pub async fn register(&self, partition_id: u16, source: Arc<dyn ReplicationSource>) {
        self.sources.write().await.insert(partition_id, source);
    }

    pub async fn deregister(&self, partition_id: u16) {
        self.sources.write().await.remove(&partition_id);
    }

    /// Serve one connection until the peer closes it.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = FramedStream::new(stream);
        loop {
            let frame = match framed.read_frame().await {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            match frame.message_type {
                MessageType::Request => self.answer(&mut framed, frame).await?,
                MessageType::Subscription => self.forward_subscription(frame).await,
                other => {
                    warn!(message_type = ?other, "Ignoring unexpected frame");
                }
            }
        }
    }

    async fn answer<S>(&self, framed: &mut FramedStream<S>, frame: Frame) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut payload = frame.payload;
        let request = match ReplicationRequest::decode(&mut payload) {
            Ok(request) => request,
            Err(e) => {
                let error = ReplicationError::Decode(e);
                return framed.respond_error(&error.to_response()).await;
            }
        };

        match self.dispatch(request).await {
            Ok(response) => {
                let frame = Frame::from_payload(MessageType::Response, response)?;
                framed.write_frame(&frame).await
            }
            Err(e) => {
                debug!(error = %e, "Replication request failed");
                framed.respond_error(&e.to_response()).await
            }
        }
    }

    async fn dispatch(&self, request: ReplicationRequest) -> Result<bytes::Bytes, ReplicationError> {
        let partition_id = request.partition_id();
        let source = self
            .sources
            .read()
            .await
            .get(&partition_id)
            .cloned()
            .ok_or(ReplicationError::UnknownPartition(partition_id))?;

        Ok(match request {
            ReplicationRequest::RestoreInfo(r) => source
                .restore_info(r.from_position, r.backup_position)
                .await?
                .to_bytes()?,
            ReplicationRequest::LogBlock(r) => source
                .log_block(r.from_position, r.max_entries)
                .await?
                .to_bytes()?,
            ReplicationRequest::SnapshotChunk(r) => source
                .snapshot_chunk(r.snapshot_position, r.chunk_index)
                .await?
                .to_bytes()?,
        })
    }

    async fn forward_subscription(&self, frame: Frame) {
        let Some(handler) = &self.subscriptions else {
            debug!("No subscription handler, dropping message");
            return;
        };
        if let Err(e) = handler.handle(frame.payload).await {
            warn!(error = %e, "Failed to handle subscription message");
        }
    }

    /// Accept TCP connections until `shutdown` flips to `true`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Replication server starting");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Replication server received shutdown signal");
                        break;
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            debug!(%remote_addr, "accepted connection");
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.serve_connection(stream).await {
                                    debug!(%remote_addr, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            debug!("failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        info!("Replication server stopped");
        Ok(())
    }
}
