//! The running lanbeam instance: TLS gRPC services, certificate bootstrap,
//! and discovery, composed behind a single guard.
//!
//! ```ignore
//! let config = DeviceConfig::new("dev-1", "My laptop", "laptop", "me", "/home/me/Downloads");
//! let guard = LanbeamServer::new(config).serve().await?;
//! // ... later
//! guard.shutdown().await?;
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info};

use crate::bootstrap::CertificateServer;
use crate::config::DeviceConfig;
use crate::discovery::{AnnouncerHandle, BrowserHandle, ServiceAnnouncer, ServiceBrowser};
use crate::error::Result;
use crate::events::EventBus;
use crate::identity::{Identity, CREDENTIAL_ATTEMPTS};
use crate::pb;
use crate::remote::RemoteRegistry;
use crate::transfer::ReceivingOperation;

/// Implements the registration handshake: record the caller's details,
/// answer with our own.
struct RegistrationService {
    registry: Arc<RemoteRegistry>,
    local: pb::DeviceInfo,
}

#[tonic::async_trait]
impl pb::registration_server::Registration for RegistrationService {
    async fn register(
        &self,
        request: Request<pb::DeviceInfo>,
    ) -> std::result::Result<Response<pb::DeviceInfo>, Status> {
        let info = request.into_inner();
        if info.id.is_empty() {
            return Err(Status::invalid_argument("missing device id"));
        }
        self.registry.record_registration(&info);
        debug!(peer = %info.id, "registration exchanged");
        Ok(Response::new(self.local.clone()))
    }
}

/// Implements the transfer call surface for inbound operations.
struct TransferService {
    registry: Arc<RemoteRegistry>,
    config: DeviceConfig,
    events: EventBus,
    local: pb::DeviceInfo,
}

#[tonic::async_trait]
impl pb::transfer_server::Transfer for TransferService {
    async fn negotiate(
        &self,
        request: Request<pb::TransferOffer>,
    ) -> std::result::Result<Response<pb::OfferDecision>, Status> {
        let offer = request.into_inner();
        let sender = offer
            .sender
            .clone()
            .ok_or_else(|| Status::invalid_argument("offer missing sender"))?;
        // Registration must complete before any transfer starts.
        let remote = self
            .registry
            .get(&sender.id)
            .ok_or_else(|| Status::failed_precondition("peer is not registered"))?;

        let (operation, decision) = ReceivingOperation::new(
            &offer,
            sender.id.clone(),
            self.config.download_dir.clone(),
            self.config.overwrite,
            self.events.clone(),
        );
        remote
            .register_receiving(Arc::clone(&operation))
            .map_err(Status::from)?;
        info!(
            peer = %sender.id,
            operation = offer.operation_id,
            items = offer.items.len(),
            total = offer.total_size,
            "incoming transfer offer"
        );

        if self.config.auto_accept {
            operation.grant();
        }
        let accepted = decision.await.unwrap_or(false);
        Ok(Response::new(pb::OfferDecision { accepted }))
    }

    type SendChunksStream =
        Pin<Box<dyn Stream<Item = std::result::Result<pb::ChunkAck, Status>> + Send + 'static>>;

    async fn send_chunks(
        &self,
        request: Request<Streaming<pb::FileChunk>>,
    ) -> std::result::Result<Response<Self::SendChunksStream>, Status> {
        let mut inbound = request.into_inner();
        let registry = Arc::clone(&self.registry);
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut operation: Option<Arc<ReceivingOperation>> = None;
            loop {
                match inbound.message().await {
                    Ok(Some(chunk)) => {
                        let op = match operation
                            .as_ref()
                            .filter(|op| op.id() == chunk.operation_id)
                        {
                            Some(op) => Arc::clone(op),
                            None => match registry.find_receiving(chunk.operation_id) {
                                Some((_, op)) => {
                                    operation = Some(Arc::clone(&op));
                                    op
                                }
                                None => {
                                    let _ = tx
                                        .send(Err(Status::not_found(format!(
                                            "unknown operation {}",
                                            chunk.operation_id
                                        ))))
                                        .await;
                                    break;
                                }
                            },
                        };
                        match op.process_chunk(chunk).await {
                            Ok(bytes_received) => {
                                if tx.send(Ok(pb::ChunkAck { bytes_received })).await.is_err() {
                                    // Caller went away; discard partial output.
                                    op.cancel().await;
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(Status::from(e))).await;
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        if let Some(op) = &operation {
                            if let Err(e) = op.finish().await {
                                debug!("receive did not complete: {e}");
                            }
                        }
                        break;
                    }
                    Err(status) => {
                        debug!("chunk stream error: {status}");
                        if let Some(op) = &operation {
                            op.cancel().await;
                        }
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn cancel(
        &self,
        request: Request<pb::OperationRef>,
    ) -> std::result::Result<Response<pb::CancelAck>, Status> {
        let opref = request.into_inner();
        if opref.device_id == self.local.id {
            // One of our own sending operations.
            let (_, op) = self
                .registry
                .find_sending(opref.operation_id)
                .ok_or_else(|| Status::not_found("unknown operation"))?;
            op.cancel();
        } else {
            let remote = self
                .registry
                .get(&opref.device_id)
                .ok_or_else(|| Status::not_found("unknown remote"))?;
            let op = remote
                .find_receiving(opref.operation_id)
                .ok_or_else(|| Status::not_found("unknown operation"))?;
            op.cancel().await;
        }
        Ok(Response::new(pb::CancelAck {}))
    }

    async fn request_retry(
        &self,
        request: Request<pb::OperationRef>,
    ) -> std::result::Result<Response<pb::RetryAck>, Status> {
        let opref = request.into_inner();
        // Only the side holding the source data can restart a transfer.
        if opref.device_id != self.local.id {
            return Ok(Response::new(pb::RetryAck { accepted: false }));
        }
        let accepted = match self.registry.find_sending(opref.operation_id) {
            Some((remote, op)) if op.status().is_terminal() => {
                match remote.transfer_client() {
                    Ok(client) => {
                        let local = self.local.clone();
                        tokio::spawn(async move {
                            if let Err(e) = op.retry(client, local).await {
                                debug!(operation = opref.operation_id, "retry ended: {e}");
                            }
                        });
                        true
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        };
        Ok(Response::new(pb::RetryAck { accepted }))
    }
}

/// Builder for a running lanbeam instance.
pub struct LanbeamServer {
    config: DeviceConfig,
    identity: Option<Identity>,
    events: EventBus,
    discovery: bool,
}

impl LanbeamServer {
    /// Create a builder for the given device configuration.
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            identity: None,
            events: EventBus::default(),
            discovery: true,
        }
    }

    /// Create a builder from a settings provider snapshot.
    pub fn from_settings(provider: &dyn crate::config::SettingsProvider) -> Self {
        Self::new(provider.device_config())
    }

    /// Use a persisted identity instead of generating a fresh one.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Take the identity from a credential provider.
    pub fn with_credentials(
        mut self,
        provider: &dyn crate::identity::CredentialProvider,
    ) -> Result<Self> {
        self.identity = Some(provider.identity()?);
        Ok(self)
    }

    /// Enable or disable mDNS announce/browse. With discovery off, peers
    /// can still be fed to the registry directly.
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discovery = enabled;
        self
    }

    /// The bus this instance notifies on.
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Start everything: bootstrap listener, TLS gRPC server, announcer,
    /// and browser. Returns a guard whose [`shutdown`](ServerGuard::shutdown)
    /// tears the instance down in dependency order.
    pub async fn serve(self) -> Result<ServerGuard> {
        let identity = match self.identity {
            Some(identity) => identity,
            None => Identity::generate_with_retry(&self.config, CREDENTIAL_ATTEMPTS).await?,
        };

        let registry = RemoteRegistry::new(&self.config, self.events.clone());
        let bootstrap =
            CertificateServer::bind(self.config.auth_port, identity.certificate_pem().to_vec())
                .await?;

        // Bind explicitly so an ephemeral transfer port is observable.
        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.transfer_port)).await?;
        let rpc_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let local = self.config.device_info();
        let router = Server::builder()
            .tls_config(ServerTlsConfig::new().identity(identity.tls_identity()))?
            .add_service(pb::registration_server::RegistrationServer::new(
                RegistrationService {
                    registry: Arc::clone(&registry),
                    local: local.clone(),
                },
            ))
            .add_service(pb::transfer_server::TransferServer::new(TransferService {
                registry: Arc::clone(&registry),
                config: self.config.clone(),
                events: self.events.clone(),
                local,
            }));
        let rpc_handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
            };
            if let Err(e) = router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await
            {
                error!("transfer server error: {e}");
            }
        });
        info!(%rpc_addr, "transfer server listening");

        let (announcer, browser) = if self.discovery {
            let (discovery_tx, mut discovery_rx) = mpsc::channel(16);
            let browser_handle =
                ServiceBrowser::spawn(self.config.clone(), self.events.clone(), discovery_tx);
            let pump_registry = Arc::clone(&registry);
            let pump = tokio::spawn(async move {
                while let Some(event) = discovery_rx.recv().await {
                    pump_registry.handle_discovery(event);
                }
            });
            let announcer_handle =
                ServiceAnnouncer::spawn(self.config.clone(), self.events.clone());
            (Some(announcer_handle), Some((browser_handle, pump)))
        } else {
            (None, None)
        };

        Ok(ServerGuard {
            registry,
            events: self.events,
            shutdown_tx,
            rpc_handle: Some(rpc_handle),
            rpc_addr,
            bootstrap: Some(bootstrap),
            announcer,
            browser,
        })
    }
}

/// Guard for a running instance.
pub struct ServerGuard {
    registry: Arc<RemoteRegistry>,
    events: EventBus,
    shutdown_tx: broadcast::Sender<()>,
    rpc_handle: Option<JoinHandle<()>>,
    rpc_addr: SocketAddr,
    bootstrap: Option<CertificateServer>,
    announcer: Option<AnnouncerHandle>,
    browser: Option<(BrowserHandle, JoinHandle<()>)>,
}

impl ServerGuard {
    /// The peer registry.
    pub fn registry(&self) -> Arc<RemoteRegistry> {
        Arc::clone(&self.registry)
    }

    /// The bus this instance notifies on.
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Bound address of the TLS transfer server.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Bound address of the certificate bootstrap listener.
    pub fn bootstrap_addr(&self) -> Option<SocketAddr> {
        self.bootstrap.as_ref().map(|b| b.local_addr())
    }

    /// Graceful teardown: every in-flight operation reaches a terminal
    /// state before any listening service stops.
    pub async fn shutdown(mut self) -> Result<()> {
        self.registry.shutdown_all().await;

        if let Some(announcer) = self.announcer.take() {
            announcer.shutdown().await;
        }
        if let Some((browser, pump)) = self.browser.take() {
            browser.shutdown().await;
            pump.abort();
            let _ = pump.await;
        }

        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.rpc_handle.take() {
            let _ = handle.await;
        }
        if let Some(bootstrap) = self.bootstrap.take() {
            bootstrap.shutdown().await;
        }
        Ok(())
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
