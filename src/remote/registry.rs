//! The registry of known peers.
//!
//! The peer map is mutated only on discovery events and explicit
//! add/remove calls, all funneled through one lock held briefly and never
//! across an await, so concurrent sightings cannot lose updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::connection::Remote;
use super::details::{ConnectionStatus, RemoteDetails};
use crate::config::DeviceConfig;
use crate::discovery::DiscoveryEvent;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, OperationId, RemoteId};
use crate::pb;
use crate::transfer::{OperationSnapshot, SendingOperation};

/// Hands out operation ids, monotonic for this device.
#[derive(Debug, Clone)]
pub struct OperationIdAllocator(Arc<AtomicU64>);

impl OperationIdAllocator {
    /// Start counting from 1.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    /// Next unused id.
    pub fn allocate(&self) -> OperationId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for OperationIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps peer ids to [`Remote`]s and routes discovery into them.
pub struct RemoteRegistry {
    remotes: Mutex<HashMap<RemoteId, Arc<Remote>>>,
    local: pb::DeviceInfo,
    op_ids: OperationIdAllocator,
    events: EventBus,
}

impl RemoteRegistry {
    /// Create an empty registry for this device.
    pub fn new(config: &DeviceConfig, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            remotes: Mutex::new(HashMap::new()),
            local: config.device_info(),
            op_ids: OperationIdAllocator::new(),
            events,
        })
    }

    /// The bus this registry notifies on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Upsert from a discovery sighting. An unknown peer gets a new remote
    /// in `Disconnected`; a known one has its endpoint refreshed. Either
    /// way a single connect attempt is made if the remote is currently in
    /// `Disconnected`, `Idle`, or `Error`: one attempt per fresh sighting,
    /// never a storm against a peer that is deliberately offline.
    pub fn handle_discovery(&self, event: DiscoveryEvent) {
        let connectable = {
            let mut remotes = self.remotes.lock().expect("registry lock");
            match remotes.get(&event.peer_id) {
                Some(remote) => {
                    remote.apply_discovery(&event);
                    match remote.status() {
                        ConnectionStatus::Disconnected
                        | ConnectionStatus::Idle
                        | ConnectionStatus::Error => Some(Arc::clone(remote)),
                        ConnectionStatus::Connecting | ConnectionStatus::Connected => None,
                    }
                }
                None => {
                    info!(peer = %event.peer_id, "new remote discovered");
                    let remote = Remote::new(
                        RemoteDetails::from_discovery(&event),
                        self.local.clone(),
                        self.op_ids.clone(),
                        self.events.clone(),
                    );
                    remotes.insert(event.peer_id.clone(), Arc::clone(&remote));
                    self.events.emit(Event::RemoteAdded(event.peer_id.clone()));
                    Some(remote)
                }
            }
        };

        if let Some(remote) = connectable {
            tokio::spawn(async move {
                if let Err(e) = remote.connect().await {
                    debug!(remote = %remote.id(), "connect attempt failed: {e}");
                }
            });
        }
    }

    /// Record an inbound registration: the caller found us before we found
    /// it. Missing metadata fields take their documented fallbacks.
    pub fn record_registration(&self, info: &pb::DeviceInfo) -> Arc<Remote> {
        let mut remotes = self.remotes.lock().expect("registry lock");
        if let Some(remote) = remotes.get(&info.id) {
            remote.apply_registration(info);
            return Arc::clone(remote);
        }
        info!(peer = %info.id, "new remote registered");
        let remote = Remote::new(
            RemoteDetails::from_registration(info),
            self.local.clone(),
            self.op_ids.clone(),
            self.events.clone(),
        );
        remotes.insert(info.id.clone(), Arc::clone(&remote));
        self.events.emit(Event::RemoteAdded(info.id.clone()));
        remote
    }

    /// Look up a remote by peer id.
    pub fn get(&self, peer_id: &str) -> Option<Arc<Remote>> {
        self.remotes.lock().expect("registry lock").get(peer_id).cloned()
    }

    /// Snapshot one remote's details.
    pub fn snapshot(&self, peer_id: &str) -> Option<RemoteDetails> {
        self.get(peer_id).map(|remote| remote.details())
    }

    /// Snapshot one operation.
    pub fn operation(&self, peer_id: &str, id: OperationId) -> Option<OperationSnapshot> {
        self.get(peer_id)?
            .operations()
            .into_iter()
            .find(|op| op.id == id)
    }

    /// Snapshots of every known remote.
    pub fn remotes(&self) -> Vec<RemoteDetails> {
        self.remotes
            .lock()
            .expect("registry lock")
            .values()
            .map(|remote| remote.details())
            .collect()
    }

    /// Find one of our own sending operations, whichever remote owns it.
    pub fn find_sending(&self, id: OperationId) -> Option<(Arc<Remote>, Arc<SendingOperation>)> {
        let remotes: Vec<_> = self
            .remotes
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect();
        remotes
            .into_iter()
            .find_map(|remote| remote.find_sending(id).map(|op| (remote, op)))
    }

    /// Find a receiving operation by the sender's operation id.
    pub fn find_receiving(
        &self,
        id: OperationId,
    ) -> Option<(Arc<Remote>, Arc<crate::transfer::ReceivingOperation>)> {
        let remotes: Vec<_> = self
            .remotes
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect();
        remotes
            .into_iter()
            .find_map(|remote| remote.find_receiving(id).map(|op| (remote, op)))
    }

    /// Tear a remote down and forget it. In-flight operations are
    /// cancelled first; a remote is never destroyed mid-transfer.
    pub async fn remove(&self, peer_id: &str) -> Result<()> {
        let remote = self
            .remotes
            .lock()
            .expect("registry lock")
            .remove(peer_id)
            .ok_or_else(|| Error::UnknownRemote(peer_id.to_string()))?;
        remote.shutdown().await;
        self.events.emit(Event::RemoteRemoved(peer_id.to_string()));
        Ok(())
    }

    /// Force every remote's connection closed and wait for completion.
    /// Callers stop listening services only after this returns, so no
    /// transfer is orphaned by teardown.
    pub async fn shutdown_all(&self) {
        let remotes: Vec<_> = self
            .remotes
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect();
        for remote in remotes {
            remote.shutdown().await;
        }
        debug!("all remotes shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transfer::{ReceivingOperation, TransferStatus};

    fn registry() -> Arc<RemoteRegistry> {
        let config = DeviceConfig::new("dev-local", "Local", "localhost", "me", "/tmp/downloads");
        RemoteRegistry::new(&config, EventBus::new(64))
    }

    fn sighting(id: &str) -> DiscoveryEvent {
        DiscoveryEvent {
            peer_id: id.into(),
            hostname: format!("{id}-host"),
            address: None,
            transfer_port: 42000,
            auth_port: 42001,
            api_version: "2".into(),
        }
    }

    #[tokio::test]
    async fn repeated_sightings_create_one_remote() {
        let registry = registry();
        registry.handle_discovery(sighting("dev-a"));
        registry.handle_discovery(sighting("dev-a"));
        registry.handle_discovery(sighting("dev-a"));
        assert_eq!(registry.remotes().len(), 1);
        assert!(registry.snapshot("dev-a").is_some());
    }

    #[tokio::test]
    async fn sightings_of_different_peers_create_distinct_remotes() {
        let registry = registry();
        registry.handle_discovery(sighting("dev-a"));
        registry.handle_discovery(sighting("dev-b"));
        assert_eq!(registry.remotes().len(), 2);
    }

    #[tokio::test]
    async fn inbound_registration_creates_and_updates() {
        let registry = registry();
        let info = pb::DeviceInfo {
            id: "dev-c".into(),
            display_name: "C".into(),
            hostname: "chost".into(),
            username: "carol".into(),
            api_version: "2".into(),
        };
        registry.record_registration(&info);
        assert_eq!(registry.snapshot("dev-c").unwrap().display_name, "C");

        // A later sighting refreshes the endpoint without duplicating.
        registry.handle_discovery(sighting("dev-c"));
        assert_eq!(registry.remotes().len(), 1);
    }

    #[tokio::test]
    async fn remove_tears_down_and_forgets() {
        let registry = registry();
        registry.handle_discovery(sighting("dev-a"));
        registry.remove("dev-a").await.unwrap();
        assert!(registry.snapshot("dev-a").is_none());
        assert!(matches!(
            registry.remove("dev-a").await.unwrap_err(),
            Error::UnknownRemote(_)
        ));
    }

    #[tokio::test]
    async fn shutdown_all_terminates_operations() {
        let registry = registry();
        registry.handle_discovery(sighting("dev-a"));
        let remote = registry.get("dev-a").unwrap();
        let (op, _decision) = ReceivingOperation::new(
            &pb::TransferOffer {
                operation_id: 3,
                sender: None,
                items: vec![],
                total_size: 0,
            },
            "dev-a".into(),
            std::env::temp_dir(),
            false,
            EventBus::new(64),
        );
        remote.register_receiving(Arc::clone(&op)).unwrap();

        registry.shutdown_all().await;
        assert!(op.status().is_terminal());
        assert_eq!(op.status(), TransferStatus::Cancelled);
        // Remotes survive shutdown for querying; they are just closed.
        assert_eq!(registry.remotes().len(), 1);
    }

    #[test]
    fn operation_ids_are_monotonic() {
        let ids = OperationIdAllocator::new();
        let a = ids.allocate();
        let b = ids.allocate();
        let c = ids.allocate();
        assert!(a < b && b < c);
    }
}
