//! Receive-direction operations.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use super::operation::{Direction, OperationCore, OperationSnapshot, TransferStatus};
use super::sink::{create_directory, FileSink};
use crate::error::{Error, Result};
use crate::events::{EventBus, OperationId, RemoteId};
use crate::pb;

/// Materializes one incoming offer under the download root.
///
/// Chunks are applied strictly in arrival order: at most one sink is open,
/// and a chunk must either continue that sink's item or begin the next item
/// of the negotiated manifest. Anything else means sender and receiver have
/// diverged and the whole operation fails with `FILENAME_MISMATCH`.
///
/// There is no local retry: only the side holding the source data can
/// restart a transfer, so retrying is the sender's `RequestRetry` call.
pub struct ReceivingOperation {
    core: OperationCore,
    manifest: Vec<pb::ItemManifest>,
    download_dir: PathBuf,
    overwrite: bool,
    decision_tx: std::sync::Mutex<Option<oneshot::Sender<bool>>>,
    state: Mutex<ReceiveState>,
}

#[derive(Default)]
struct ReceiveState {
    /// Index of the next manifest item not yet begun.
    next_index: usize,
    active: Option<ActiveFile>,
    /// Original directory prefix -> on-disk prefix, for renamed parents.
    remap: Vec<(String, String)>,
}

struct ActiveFile {
    sink: FileSink,
    declared: u64,
}

impl ReceivingOperation {
    /// Create an operation for an incoming offer, in `WaitingForPermission`.
    /// The returned receiver resolves with the grant/deny decision.
    pub(crate) fn new(
        offer: &pb::TransferOffer,
        remote_id: RemoteId,
        download_dir: PathBuf,
        overwrite: bool,
        events: EventBus,
    ) -> (Arc<Self>, oneshot::Receiver<bool>) {
        let (decision_tx, decision_rx) = oneshot::channel();
        let core = OperationCore::new(
            offer.operation_id,
            remote_id,
            Direction::Receiving,
            TransferStatus::WaitingForPermission,
            events,
        );
        core.set_total_size(offer.total_size);
        let operation = Arc::new(Self {
            core,
            manifest: offer.items.clone(),
            download_dir,
            overwrite,
            decision_tx: std::sync::Mutex::new(Some(decision_tx)),
            state: Mutex::new(ReceiveState::default()),
        });
        (operation, decision_rx)
    }

    /// Operation id, as allocated by the sending device.
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

    /// Accept the offer and start receiving.
    pub fn grant(&self) {
        if let Some(tx) = self.decision_tx.lock().expect("decision lock").take() {
            let _ = tx.send(true);
            self.core.set_status(TransferStatus::Transferring);
            debug!(operation = self.core.id(), "offer granted");
        }
    }

    /// Refuse the offer; the operation resolves to `Cancelled`.
    pub fn deny(&self) {
        if let Some(tx) = self.decision_tx.lock().expect("decision lock").take() {
            let _ = tx.send(false);
            self.core.set_status(TransferStatus::Cancelled);
            debug!(operation = self.core.id(), "offer denied");
        }
    }

    /// Receiving operations cannot be retried locally; the sender must
    /// re-initiate.
    pub fn retry(&self) -> Result<()> {
        Err(Error::RetryNotPermitted)
    }

    /// Apply one chunk. Returns the cumulative byte count for the ack.
    pub async fn process_chunk(&self, chunk: pb::FileChunk) -> Result<u64> {
        if self.core.status() != TransferStatus::Transferring {
            return Err(Error::connection("operation is not receiving"));
        }

        let mut state = self.state.lock().await;

        // Continuation of the item currently being written?
        if let Some(active) = state.active.as_mut() {
            if chunk.relative_path == active.sink.negotiated_path() {
                if active.sink.bytes_written() + chunk.data.len() as u64 > active.declared {
                    return self
                        .fail_locked(&mut state, "peer exceeded the item's declared size")
                        .await;
                }
                let written = active.sink.process_chunk(&chunk).await?;
                self.core.add_bytes(written);
                if active.sink.bytes_written() == active.declared {
                    let mut done = state.active.take().expect("active sink").sink;
                    done.close().await?;
                }
                return Ok(self.core.bytes_transferred());
            }
        }

        // Otherwise the chunk must begin the next manifest item.
        let Some(entry) = self.manifest.get(state.next_index) else {
            return self
                .fail_locked(&mut state, "chunk received after the final item")
                .await;
        };
        if entry.relative_path != chunk.relative_path {
            let expected = state
                .active
                .as_ref()
                .map(|a| a.sink.negotiated_path().to_string())
                .unwrap_or_else(|| entry.relative_path.clone());
            let actual = chunk.relative_path.clone();
            if let Some(mut active) = state.active.take() {
                active.sink.fail().await;
            }
            self.core
                .set_status(TransferStatus::Failed(format!(
                    "FILENAME_MISMATCH: expected {expected:?}, got {actual:?}"
                )));
            return Err(Error::FilenameMismatch { expected, actual });
        }
        let entry = entry.clone();

        // A sink only stays active while short of its declared size, so a
        // successor starting now means the previous item ended short.
        if state.active.is_some() {
            return self
                .fail_locked(&mut state, "item ended short of its declared size")
                .await;
        }
        state.next_index += 1;

        let disk_relative = apply_remap(&state.remap, &entry.relative_path);
        match entry.kind() {
            pb::ItemKind::Directory => {
                let (_, resolved_relative) =
                    create_directory(&self.download_dir, &disk_relative, self.overwrite).await?;
                if resolved_relative != disk_relative {
                    // Descendants of a renamed directory land under the new
                    // name while their chunk identity keeps the original.
                    state.remap.push((
                        format!("{}/", entry.relative_path),
                        format!("{resolved_relative}/"),
                    ));
                }
            }
            pb::ItemKind::File => {
                let mut sink = FileSink::create(
                    &self.download_dir,
                    entry.relative_path.clone(),
                    &disk_relative,
                    self.overwrite,
                )
                .await?;
                let written = sink.process_chunk(&chunk).await?;
                self.core.add_bytes(written);
                if sink.bytes_written() == entry.size {
                    sink.close().await?;
                } else {
                    state.active = Some(ActiveFile {
                        sink,
                        declared: entry.size,
                    });
                }
            }
        }
        Ok(self.core.bytes_transferred())
    }

    /// Handle the end of the chunk stream: verify every item arrived and
    /// resolve the operation.
    pub async fn finish(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.core.status() != TransferStatus::Transferring {
            // Cancelled or already failed; nothing left but cleanup.
            if let Some(mut active) = state.active.take() {
                active.sink.fail().await;
            }
            return Ok(());
        }
        if state.active.is_some() || state.next_index < self.manifest.len() {
            if let Some(mut active) = state.active.take() {
                active.sink.fail().await;
            }
            self.core
                .set_status(TransferStatus::Failed("transfer ended early".into()));
            return Err(Error::connection("transfer ended early"));
        }
        self.core.verify_complete();
        self.core.set_status(TransferStatus::Finished);
        debug!(operation = self.core.id(), "receive finished");
        Ok(())
    }

    /// Stop accepting chunks, discard partial output, resolve to
    /// `Cancelled`, and notify observers once.
    pub async fn cancel(&self) {
        if !self.core.request_cancel() {
            return;
        }
        // A pending offer is implicitly refused.
        if let Some(tx) = self.decision_tx.lock().expect("decision lock").take() {
            let _ = tx.send(false);
        }
        let mut state = self.state.lock().await;
        if let Some(mut active) = state.active.take() {
            active.sink.fail().await;
        }
        self.core.set_status(TransferStatus::Cancelled);
        debug!(operation = self.core.id(), "receiving operation cancelled");
    }

    async fn fail_locked(&self, state: &mut ReceiveState, reason: &str) -> Result<u64> {
        warn!(operation = self.core.id(), "receive failed: {reason}");
        if let Some(mut active) = state.active.take() {
            active.sink.fail().await;
        }
        self.core
            .set_status(TransferStatus::Failed(reason.to_string()));
        Err(Error::connection(reason.to_string()))
    }
}

fn apply_remap(remap: &[(String, String)], original: &str) -> String {
    remap
        .iter()
        .filter(|(from, _)| original.starts_with(from.as_str()))
        .max_by_key(|(from, _)| from.len())
        .map(|(from, to)| format!("{to}{}", &original[from.len()..]))
        .unwrap_or_else(|| original.to_string())
}
