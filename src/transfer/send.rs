//! Send-direction operations.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::{debug, trace};

use super::item::{flatten, Item};
use super::operation::{Direction, OperationCore, OperationSnapshot, TransferStatus};
use super::source::FileSource;
use crate::error::{Error, Result};
use crate::events::{EventBus, OperationId, RemoteId};
use crate::pb;
use crate::pb::transfer_client::TransferClient;

/// Streams a selection of files and folders to one peer.
///
/// The selection is flattened once per attempt; a retry re-runs the same
/// file list as a fresh attempt. Chunks go out strictly in flattened order
/// with one chunk in flight at a time; the per-chunk ack is the
/// back-pressure.
pub struct SendingOperation {
    core: OperationCore,
    roots: Vec<PathBuf>,
}

impl SendingOperation {
    pub(crate) fn new(
        id: OperationId,
        remote_id: RemoteId,
        roots: Vec<PathBuf>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: OperationCore::new(
                id,
                remote_id,
                Direction::Sending,
                TransferStatus::Initialized,
                events,
            ),
            roots,
        })
    }

    /// Operation id, unique per originating device.
    pub fn id(&self) -> OperationId {
        self.core.id()
    }

    /// Current status.
    pub fn status(&self) -> TransferStatus {
        self.core.status()
    }

    /// Point-in-time view for the query surface.
    pub fn snapshot(&self) -> OperationSnapshot {
        self.core.snapshot()
    }

    /// Negotiate the offer and stream every chunk. Resolves the operation
    /// into a terminal state before returning.
    pub async fn start(&self, client: TransferClient<Channel>, local: pb::DeviceInfo) -> Result<()> {
        if self.core.status() != TransferStatus::Initialized {
            return Err(Error::InvalidTransition("start requires a fresh operation"));
        }
        match self.run(client, local).await {
            Ok(()) => {
                if self.core.cancel_requested() {
                    self.core.set_status(TransferStatus::Cancelled);
                    return Ok(());
                }
                self.core.verify_complete();
                self.core.set_status(TransferStatus::Finished);
                Ok(())
            }
            Err(e) => {
                if self.core.cancel_requested() {
                    self.core.set_status(TransferStatus::Cancelled);
                } else {
                    self.core.set_status(TransferStatus::Failed(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Stop issuing chunks and resolve to `Cancelled`. The peer notices the
    /// early end of the chunk stream and discards its partial output.
    pub fn cancel(&self) {
        if self.core.request_cancel() {
            self.core.set_status(TransferStatus::Cancelled);
            debug!(operation = self.core.id(), "sending operation cancelled");
        }
    }

    /// Start a fresh attempt with the same file list. Only valid from a
    /// terminal failed/cancelled state.
    pub async fn retry(&self, client: TransferClient<Channel>, local: pb::DeviceInfo) -> Result<()> {
        self.core.reset_for_retry()?;
        debug!(operation = self.core.id(), "retrying sending operation");
        self.start(client, local).await
    }

    async fn run(
        &self,
        mut client: TransferClient<Channel>,
        local: pb::DeviceInfo,
    ) -> Result<()> {
        let items = flatten(&self.roots).await?;
        let total: u64 = items.iter().map(Item::size).sum();
        self.core.set_total_size(total);

        let offer = pb::TransferOffer {
            operation_id: self.core.id(),
            sender: Some(local),
            items: items.iter().map(Item::manifest).collect(),
            total_size: total,
        };
        let decision = client.negotiate(offer).await?.into_inner();
        if !decision.accepted {
            self.core.set_status(TransferStatus::Cancelled);
            return Err(Error::Denied);
        }

        self.core.set_status(TransferStatus::Transferring);
        self.stream_items(&mut client, items).await
    }

    async fn stream_items(
        &self,
        client: &mut TransferClient<Channel>,
        items: Vec<Item>,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<pb::FileChunk>(1);
        let mut acks = client
            .send_chunks(ReceiverStream::new(rx))
            .await?
            .into_inner();

        for item in items {
            if self.core.cancel_requested() {
                return Ok(());
            }
            match item {
                Item::Directory { relative_path } => {
                    let chunk = pb::FileChunk {
                        operation_id: self.core.id(),
                        relative_path,
                        data: Vec::new(),
                        kind: pb::ItemKind::Directory as i32,
                        mode: 0o755,
                    };
                    self.deliver(&tx, &mut acks, chunk, 0).await?;
                }
                Item::File {
                    relative_path,
                    source,
                    mode,
                    ..
                } => {
                    let mut file = FileSource::open(&source, relative_path.clone()).await?;
                    while let Some(data) = file.next_chunk().await? {
                        if self.core.cancel_requested() {
                            file.cancel();
                            return Ok(());
                        }
                        let payload = data.len() as u64;
                        let chunk = pb::FileChunk {
                            operation_id: self.core.id(),
                            relative_path: relative_path.clone(),
                            data,
                            kind: pb::ItemKind::File as i32,
                            mode,
                        };
                        self.deliver(&tx, &mut acks, chunk, payload).await?;
                    }
                }
            }
        }

        // Close our half and observe the peer finishing cleanly.
        drop(tx);
        while acks.message().await?.is_some() {}
        Ok(())
    }

    /// Ship one chunk and wait for its ack before counting the bytes. A
    /// chunk is atomic on the wire: it is either fully sent or not at all.
    async fn deliver(
        &self,
        tx: &mpsc::Sender<pb::FileChunk>,
        acks: &mut tonic::Streaming<pb::ChunkAck>,
        chunk: pb::FileChunk,
        payload: u64,
    ) -> Result<()> {
        tx.send(chunk)
            .await
            .map_err(|_| Error::connection("chunk stream closed"))?;
        let ack = acks
            .message()
            .await?
            .ok_or_else(|| Error::connection("peer ended ack stream early"))?;
        if payload > 0 {
            self.core.add_bytes(payload);
        }
        trace!(acked = ack.bytes_received, "chunk acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation() -> Arc<SendingOperation> {
        SendingOperation::new(
            1,
            "dev-peer".into(),
            vec![PathBuf::from("/nonexistent")],
            EventBus::new(64),
        )
    }

    #[test]
    fn starts_initialized() {
        let op = operation();
        assert_eq!(op.status(), TransferStatus::Initialized);
        assert_eq!(op.snapshot().direction, Direction::Sending);
    }

    #[test]
    fn cancel_before_start_is_terminal_and_idempotent() {
        let op = operation();
        op.cancel();
        assert_eq!(op.status(), TransferStatus::Cancelled);
        op.cancel();
        assert_eq!(op.status(), TransferStatus::Cancelled);
    }
}
