//! Change notifications for remotes and transfer operations.
//!
//! Observers subscribe to a broadcast channel and receive events keyed by
//! peer/operation id only; they never hold a reference into the registry.
//! Current state is fetched through the registry's snapshot queries, so a
//! lagging or dropped subscriber costs nothing but its own missed events.

use tokio::sync::broadcast;

/// Identifies a remote device (its unique device id).
pub type RemoteId = String;

/// Identifies one transfer operation, unique per originating device.
pub type OperationId = u64;

/// A state or progress change somewhere in the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A remote was added to the registry.
    RemoteAdded(RemoteId),
    /// A remote's details or connection status changed.
    RemoteUpdated(RemoteId),
    /// A remote was removed from the registry.
    RemoteRemoved(RemoteId),
    /// A transfer operation was created on a remote.
    OperationAdded {
        /// The owning remote.
        remote: RemoteId,
        /// The new operation.
        operation: OperationId,
    },
    /// An operation's status or byte count changed.
    OperationUpdated {
        /// The owning remote.
        remote: RemoteId,
        /// The changed operation.
        operation: OperationId,
    },
    /// A discovery component failed beyond self-recovery.
    DiscoveryFailed {
        /// Which component failed ("announcer" or "browser").
        component: &'static str,
        /// Human-readable failure reason.
        reason: String,
    },
}

/// Fan-out channel for [`Event`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
