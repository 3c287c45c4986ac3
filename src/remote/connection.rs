//! One peer's connection state machine and its transfer operations.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

use super::details::{ConnectionStatus, RemoteDetails};
use super::registry::OperationIdAllocator;
use crate::bootstrap;
use crate::discovery::DiscoveryEvent;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, OperationId, RemoteId};
use crate::pb;
use crate::pb::registration_client::RegistrationClient;
use crate::pb::transfer_client::TransferClient;
use crate::transfer::{OperationSnapshot, ReceivingOperation, SendingOperation};

/// Timeout for opening the TLS channel.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// This device's model of one peer, created on first sighting and kept
/// until removal. Owns the secure channel and every transfer operation
/// with that peer; a remote is never dropped mid-transfer, so teardown
/// cancels in-flight operations first.
pub struct Remote {
    id: RemoteId,
    details: RwLock<RemoteDetails>,
    channel: Mutex<Option<Channel>>,
    sending: Mutex<Vec<Arc<SendingOperation>>>,
    receiving: Mutex<Vec<Arc<ReceivingOperation>>>,
    op_ids: OperationIdAllocator,
    local: pb::DeviceInfo,
    events: EventBus,
}

impl Remote {
    pub(crate) fn new(
        details: RemoteDetails,
        local: pb::DeviceInfo,
        op_ids: OperationIdAllocator,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: details.id.clone(),
            details: RwLock::new(details),
            channel: Mutex::new(None),
            sending: Mutex::new(Vec::new()),
            receiving: Mutex::new(Vec::new()),
            op_ids,
            local,
            events,
        })
    }

    /// The peer's device id.
    pub fn id(&self) -> &RemoteId {
        &self.id
    }

    /// Snapshot of the peer's details.
    pub fn details(&self) -> RemoteDetails {
        self.details.read().expect("details lock").clone()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.details.read().expect("details lock").status
    }

    /// Snapshots of every operation on this remote, sending then receiving.
    pub fn operations(&self) -> Vec<OperationSnapshot> {
        let mut snapshots: Vec<_> = self
            .sending
            .lock()
            .expect("sending lock")
            .iter()
            .map(|op| op.snapshot())
            .collect();
        snapshots.extend(
            self.receiving
                .lock()
                .expect("receiving lock")
                .iter()
                .map(|op| op.snapshot()),
        );
        snapshots
    }

    /// Refresh the network endpoint from a discovery sighting.
    pub(crate) fn apply_discovery(&self, event: &DiscoveryEvent) {
        self.update_details(|details| details.apply_discovery(event));
    }

    /// Merge peer metadata from a registration exchange.
    pub(crate) fn apply_registration(&self, info: &pb::DeviceInfo) {
        self.update_details(|details| details.apply_registration(info));
    }

    /// Drive the connection to `Connected`: fetch the peer's certificate
    /// over the insecure bootstrap port, open a TLS channel anchored on it,
    /// and exchange registration details. Any step failing parks the remote
    /// in `Error` with the reason recorded; a fresh discovery event or an
    /// explicit [`retry`](Self::retry) attempts again.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut details = self.details.write().expect("details lock");
            match details.status {
                ConnectionStatus::Connecting | ConnectionStatus::Connected => return Ok(()),
                _ => {
                    details.status = ConnectionStatus::Connecting;
                    details.last_error = None;
                }
            }
        }
        self.notify();

        match self.establish().await {
            Ok(channel) => {
                *self.channel.lock().expect("channel lock") = Some(channel);
                self.update_details(|details| details.status = ConnectionStatus::Connected);
                info!(remote = %self.id, "connected");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.update_details(|details| {
                    details.status = ConnectionStatus::Error;
                    details.last_error = Some(reason.clone());
                });
                warn!(remote = %self.id, "connect failed: {reason}");
                Err(e)
            }
        }
    }

    /// Retry a failed connection.
    pub async fn retry(&self) -> Result<()> {
        self.connect().await
    }

    /// Explicitly disconnect: cancel in-flight operations, drop the
    /// channel, and rest in `Idle` until asked to connect again.
    pub async fn disconnect(&self) {
        self.cancel_all_operations().await;
        *self.channel.lock().expect("channel lock") = None;
        self.update_details(|details| details.status = ConnectionStatus::Idle);
        debug!(remote = %self.id, "disconnected");
    }

    /// The peer closed on us or the network went away. In-flight RPCs fail
    /// on their own; the remote becomes reconnectable by rediscovery.
    pub fn mark_disconnected(&self) {
        *self.channel.lock().expect("channel lock") = None;
        self.update_details(|details| details.status = ConnectionStatus::Disconnected);
        debug!(remote = %self.id, "peer lost");
    }

    /// Start sending the given top-level paths to this peer. Registration
    /// must have completed; the operation runs in the background and is
    /// observable through the event bus.
    pub fn begin_send(self: &Arc<Self>, paths: Vec<PathBuf>) -> Result<OperationId> {
        let client = self.transfer_client()?;
        let id = self.op_ids.allocate();
        let operation = SendingOperation::new(id, self.id.clone(), paths, self.events.clone());
        self.sending
            .lock()
            .expect("sending lock")
            .push(Arc::clone(&operation));
        self.events.emit(Event::OperationAdded {
            remote: self.id.clone(),
            operation: id,
        });

        let local = self.local.clone();
        let remote = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = operation.start(client, local).await {
                debug!(operation = id, "send ended: {e}");
                if is_connection_loss(&e) {
                    remote.mark_disconnected();
                }
            }
        });
        Ok(id)
    }

    /// Cancel one of this remote's operations and tell the peer.
    pub async fn cancel_operation(&self, id: OperationId) -> Result<()> {
        if let Some(op) = self.find_sending(id) {
            op.cancel();
            self.notify_peer_cancel(self.local.id.clone(), id);
            return Ok(());
        }
        if let Some(op) = self.find_receiving(id) {
            op.cancel().await;
            self.notify_peer_cancel(self.id.clone(), id);
            return Ok(());
        }
        Err(Error::UnknownOperation(id))
    }

    /// Restart one of our failed/cancelled sending operations.
    pub async fn retry_send(&self, id: OperationId) -> Result<()> {
        let operation = self.find_sending(id).ok_or(Error::UnknownOperation(id))?;
        let client = self.transfer_client()?;
        let local = self.local.clone();
        operation.retry(client, local).await
    }

    /// Ask the peer to restart a transfer we were receiving. Retrying
    /// locally is not possible: the peer holds the source data.
    pub async fn request_retry(&self, id: OperationId) -> Result<()> {
        let operation = self.find_receiving(id).ok_or(Error::UnknownOperation(id))?;
        if !operation.status().is_terminal() {
            return Err(Error::InvalidTransition("retry requires a terminal state"));
        }
        let mut client = self.transfer_client()?;
        let reply = client
            .request_retry(pb::OperationRef {
                device_id: self.id.clone(),
                operation_id: id,
            })
            .await?
            .into_inner();
        if !reply.accepted {
            return Err(Error::RetryNotPermitted);
        }
        Ok(())
    }

    /// Look up a sending operation by id.
    pub fn find_sending(&self, id: OperationId) -> Option<Arc<SendingOperation>> {
        self.sending
            .lock()
            .expect("sending lock")
            .iter()
            .find(|op| op.id() == id)
            .cloned()
    }

    /// Look up a receiving operation by id.
    pub fn find_receiving(&self, id: OperationId) -> Option<Arc<ReceivingOperation>> {
        self.receiving
            .lock()
            .expect("receiving lock")
            .iter()
            .find(|op| op.id() == id)
            .cloned()
    }

    /// Track an operation for an accepted incoming offer. A fresh attempt
    /// for an id whose previous attempt ended replaces it; an id that is
    /// still live is refused.
    pub(crate) fn register_receiving(&self, operation: Arc<ReceivingOperation>) -> Result<()> {
        let id = operation.id();
        {
            let mut receiving = self.receiving.lock().expect("receiving lock");
            if let Some(existing) = receiving.iter().position(|op| op.id() == id) {
                if !receiving[existing].status().is_terminal() {
                    return Err(Error::InvalidTransition(
                        "an operation with this id is still in flight",
                    ));
                }
                receiving.remove(existing);
            }
            receiving.push(operation);
        }
        self.events.emit(Event::OperationAdded {
            remote: self.id.clone(),
            operation: id,
        });
        Ok(())
    }

    /// Force every in-flight operation to a terminal state, then close the
    /// connection. Used by registry removal and shutdown.
    pub(crate) async fn shutdown(&self) {
        self.disconnect().await;
    }

    /// A transfer client over the established channel. Transfers are only
    /// permitted once registration has completed.
    pub(crate) fn transfer_client(&self) -> Result<TransferClient<Channel>> {
        if self.status() != ConnectionStatus::Connected {
            return Err(Error::connection(format!(
                "remote {} is not connected",
                self.id
            )));
        }
        let channel = self
            .channel
            .lock()
            .expect("channel lock")
            .clone()
            .ok_or_else(|| Error::connection(format!("remote {} has no channel", self.id)))?;
        Ok(TransferClient::new(channel))
    }

    async fn establish(&self) -> Result<Channel> {
        let (address, auth_port, transfer_port, hostname) = {
            let details = self.details.read().expect("details lock");
            (
                details.address,
                details.auth_port,
                details.transfer_port,
                details.hostname.clone(),
            )
        };
        let address = address
            .ok_or_else(|| Error::connection(format!("no known address for {}", self.id)))?;

        let certificate = bootstrap::fetch_certificate(
            std::net::SocketAddr::new(address, auth_port),
            bootstrap::FETCH_TIMEOUT,
        )
        .await?;

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&certificate))
            .domain_name(hostname);
        let channel = Endpoint::from_shared(format!(
            "https://{}:{transfer_port}",
            authority(address)
        ))?
        .tls_config(tls)?
        .connect_timeout(CONNECT_TIMEOUT)
        .connect()
        .await?;

        let mut client = RegistrationClient::new(channel.clone());
        let reply = client.register(self.local.clone()).await?.into_inner();
        self.apply_registration(&reply);
        Ok(channel)
    }

    async fn cancel_all_operations(&self) {
        let sending: Vec<_> = self.sending.lock().expect("sending lock").clone();
        for op in sending {
            op.cancel();
        }
        let receiving: Vec<_> = self.receiving.lock().expect("receiving lock").clone();
        for op in receiving {
            op.cancel().await;
        }
    }

    fn notify_peer_cancel(&self, device_id: String, id: OperationId) {
        // Best-effort: the local cancel stands regardless.
        if let Ok(mut client) = self.transfer_client() {
            tokio::spawn(async move {
                if let Err(e) = client
                    .cancel(pb::OperationRef {
                        device_id,
                        operation_id: id,
                    })
                    .await
                {
                    debug!(operation = id, "peer cancel notification failed: {e}");
                }
            });
        }
    }

    fn update_details(&self, mutate: impl FnOnce(&mut RemoteDetails)) {
        mutate(&mut self.details.write().expect("details lock"));
        self.notify();
    }

    fn notify(&self) {
        self.events.emit(Event::RemoteUpdated(self.id.clone()));
    }
}

fn authority(address: IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Whether an error means the secure channel itself is gone, as opposed to
/// an operation-level failure.
fn is_connection_loss(error: &Error) -> bool {
    match error {
        Error::Transport(_) => true,
        Error::Rpc(status) => status.code() == tonic::Code::Unavailable,
        _ => false,
    }
}
