//! Shared state for transfer operations: status machine, byte accounting,
//! and change notification.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::error;

use crate::error::{Error, Result};
use crate::events::{Event, EventBus, OperationId, RemoteId};

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This device is the source.
    Sending,
    /// This device is the destination.
    Receiving,
}

/// Lifecycle of one operation.
///
/// Transitions are monotonic: a terminal state (`Finished`, `Failed`,
/// `Cancelled`) is only left through an explicit send-direction retry,
/// which starts a fresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Created, not yet started.
    Initialized,
    /// Offered to the receiving user; awaiting grant or deny.
    WaitingForPermission,
    /// Bytes are moving.
    Transferring,
    /// All bytes delivered and every sink closed cleanly.
    Finished,
    /// The operation failed; the reason is carried along.
    Failed(String),
    /// Cancelled locally, by the peer, or by a denied offer.
    Cancelled,
}

impl TransferStatus {
    /// Whether this status ends the operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Finished | TransferStatus::Failed(_) | TransferStatus::Cancelled
        )
    }
}

/// Point-in-time view of an operation, for the query surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSnapshot {
    /// Operation id, unique per originating device.
    pub id: OperationId,
    /// The remote this operation belongs to.
    pub remote: RemoteId,
    /// Transfer direction.
    pub direction: Direction,
    /// Current status.
    pub status: TransferStatus,
    /// Bytes moved so far.
    pub bytes_transferred: u64,
    /// Declared total size.
    pub total_size: u64,
}

impl OperationSnapshot {
    /// Completion ratio in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.status == TransferStatus::Finished {
                1.0
            } else {
                0.0
            };
        }
        self.bytes_transferred as f64 / self.total_size as f64
    }
}

/// State shared by both operation directions.
pub(crate) struct OperationCore {
    id: OperationId,
    remote_id: RemoteId,
    direction: Direction,
    status: Mutex<TransferStatus>,
    total_size: AtomicU64,
    bytes_transferred: AtomicU64,
    cancelled: AtomicBool,
    events: EventBus,
}

impl OperationCore {
    pub(crate) fn new(
        id: OperationId,
        remote_id: RemoteId,
        direction: Direction,
        initial: TransferStatus,
        events: EventBus,
    ) -> Self {
        Self {
            id,
            remote_id,
            direction,
            status: Mutex::new(initial),
            total_size: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            events,
        }
    }

    pub(crate) fn id(&self) -> OperationId {
        self.id
    }

    pub(crate) fn remote_id(&self) -> &RemoteId {
        &self.remote_id
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn status(&self) -> TransferStatus {
        self.status.lock().expect("status lock").clone()
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_total_size(&self, total: u64) {
        self.total_size.store(total, Ordering::Release);
    }

    pub(crate) fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Acquire)
    }

    /// Record moved bytes and notify observers.
    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes_transferred.fetch_add(n, Ordering::AcqRel);
        self.notify();
    }

    /// Attempt a status transition. Illegal transitions (including any
    /// attempt to leave a terminal state) are refused and return `false`;
    /// a successful transition notifies observers exactly once.
    pub(crate) fn set_status(&self, next: TransferStatus) -> bool {
        {
            let mut status = self.status.lock().expect("status lock");
            if *status == next || !transition_allowed(&status, &next) {
                return false;
            }
            *status = next;
        }
        self.notify();
        true
    }

    /// Flag cancellation so streaming loops stop within one scheduling
    /// quantum. Returns `true` the first time only.
    pub(crate) fn request_cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Begin a fresh attempt after failure or cancellation. Send-direction
    /// only: the side holding the source data restarts a transfer.
    pub(crate) fn reset_for_retry(&self) -> Result<()> {
        if self.direction != Direction::Sending {
            return Err(Error::RetryNotPermitted);
        }
        {
            let mut status = self.status.lock().expect("status lock");
            match &*status {
                TransferStatus::Failed(_) | TransferStatus::Cancelled => {
                    *status = TransferStatus::Initialized;
                }
                _ => return Err(Error::InvalidTransition("retry requires a terminal state")),
            }
        }
        self.bytes_transferred.store(0, Ordering::Release);
        self.cancelled.store(false, Ordering::Release);
        self.notify();
        Ok(())
    }

    /// Check the finish invariant: a finished operation moved exactly the
    /// declared byte count. A mismatch is a bug, not a recoverable state.
    pub(crate) fn verify_complete(&self) -> bool {
        let bytes = self.bytes_transferred();
        let total = self.total_size();
        if bytes != total {
            error!(
                operation = self.id,
                bytes, total, "byte accounting mismatch at completion"
            );
            debug_assert_eq!(bytes, total, "byte accounting mismatch at completion");
            return false;
        }
        true
    }

    pub(crate) fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id,
            remote: self.remote_id.clone(),
            direction: self.direction,
            status: self.status(),
            bytes_transferred: self.bytes_transferred(),
            total_size: self.total_size(),
        }
    }

    fn notify(&self) {
        self.events.emit(Event::OperationUpdated {
            remote: self.remote_id.clone(),
            operation: self.id,
        });
    }
}

fn transition_allowed(from: &TransferStatus, to: &TransferStatus) -> bool {
    use TransferStatus::*;
    match (from, to) {
        (Initialized, WaitingForPermission)
        | (Initialized, Transferring)
        | (Initialized, Cancelled)
        | (Initialized, Failed(_))
        | (WaitingForPermission, Transferring)
        | (WaitingForPermission, Cancelled)
        | (WaitingForPermission, Failed(_))
        | (Transferring, Finished)
        | (Transferring, Failed(_))
        | (Transferring, Cancelled) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(direction: Direction, initial: TransferStatus) -> OperationCore {
        OperationCore::new(1, "dev-peer".into(), direction, initial, EventBus::new(64))
    }

    #[test]
    fn happy_path_send_transitions() {
        let op = core(Direction::Sending, TransferStatus::Initialized);
        assert!(op.set_status(TransferStatus::Transferring));
        assert!(op.set_status(TransferStatus::Finished));
        assert_eq!(op.status(), TransferStatus::Finished);
    }

    #[test]
    fn happy_path_receive_transitions() {
        let op = core(Direction::Receiving, TransferStatus::WaitingForPermission);
        assert!(op.set_status(TransferStatus::Transferring));
        assert!(op.set_status(TransferStatus::Finished));
    }

    #[test]
    fn terminal_states_are_sticky() {
        let op = core(Direction::Sending, TransferStatus::Initialized);
        assert!(op.set_status(TransferStatus::Transferring));
        assert!(op.set_status(TransferStatus::Cancelled));
        assert!(!op.set_status(TransferStatus::Transferring));
        assert!(!op.set_status(TransferStatus::Finished));
        assert_eq!(op.status(), TransferStatus::Cancelled);
    }

    #[test]
    fn retry_resets_sending_operation() {
        let op = core(Direction::Sending, TransferStatus::Initialized);
        op.set_total_size(10);
        op.set_status(TransferStatus::Transferring);
        op.add_bytes(4);
        op.set_status(TransferStatus::Failed("boom".into()));

        op.reset_for_retry().unwrap();
        assert_eq!(op.status(), TransferStatus::Initialized);
        assert_eq!(op.bytes_transferred(), 0);
        assert!(!op.cancel_requested());
    }

    #[test]
    fn retry_is_refused_for_receiving_operations() {
        let op = core(Direction::Receiving, TransferStatus::WaitingForPermission);
        op.set_status(TransferStatus::Cancelled);
        assert!(matches!(
            op.reset_for_retry().unwrap_err(),
            Error::RetryNotPermitted
        ));
    }

    #[test]
    fn retry_requires_terminal_state() {
        let op = core(Direction::Sending, TransferStatus::Initialized);
        op.set_status(TransferStatus::Transferring);
        assert!(op.reset_for_retry().is_err());
    }

    #[test]
    fn cancel_request_reports_first_call_only() {
        let op = core(Direction::Sending, TransferStatus::Initialized);
        assert!(op.request_cancel());
        assert!(!op.request_cancel());
        assert!(op.cancel_requested());
    }

    #[tokio::test]
    async fn status_changes_notify_once() {
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let op = OperationCore::new(
            9,
            "dev-peer".into(),
            Direction::Sending,
            TransferStatus::Initialized,
            events,
        );

        assert!(op.set_status(TransferStatus::Transferring));
        // A refused transition must not notify.
        assert!(!op.set_status(TransferStatus::Initialized));
        assert!(op.set_status(TransferStatus::Cancelled));

        assert_eq!(
            rx.recv().await.unwrap(),
            Event::OperationUpdated {
                remote: "dev-peer".into(),
                operation: 9,
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::OperationUpdated {
                remote: "dev-peer".into(),
                operation: 9,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn progress_is_ratio_of_declared_total() {
        let op = core(Direction::Sending, TransferStatus::Initialized);
        op.set_total_size(200);
        op.set_status(TransferStatus::Transferring);
        op.add_bytes(50);
        let snapshot = op.snapshot();
        assert!((snapshot.progress() - 0.25).abs() < f64::EPSILON);
    }
}
