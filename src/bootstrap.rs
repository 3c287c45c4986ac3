//! Insecure certificate bootstrap.
//!
//! A peer that has never seen this device connects to the advertised auth
//! port; the act of connecting is the request. The listener writes the
//! device certificate and closes. Authenticity is established afterwards by
//! the TLS handshake on the transfer port, which the fetched certificate
//! anchors. This exchange is trust-on-first-use by design.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How long a client waits for the full certificate.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves this device's certificate to anyone who connects.
pub struct CertificateServer {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl CertificateServer {
    /// Bind the listener and start accepting. Port 0 binds an ephemeral
    /// port, reported by [`local_addr`](Self::local_addr).
    pub async fn bind(port: u16, certificate_pem: Vec<u8>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let certificate: Arc<[u8]> = certificate_pem.into();

        info!(%local_addr, "certificate bootstrap listening");

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            // Each connection is served independently so a
                            // slow or dead client never blocks the next.
                            let certificate = Arc::clone(&certificate);
                            tokio::spawn(async move {
                                if let Err(e) = serve_one(stream, &certificate).await {
                                    debug!(%peer, "bootstrap connection dropped: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("bootstrap accept failed: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            debug!("certificate bootstrap stopped");
        });

        Ok(Self {
            local_addr,
            shutdown_tx,
            handle,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

async fn serve_one(mut stream: TcpStream, certificate: &[u8]) -> std::io::Result<()> {
    stream.write_all(certificate).await?;
    stream.shutdown().await
}

/// Client side: connect to a peer's bootstrap port and read its certificate.
pub async fn fetch_certificate(addr: SocketAddr, timeout: Duration) -> Result<Vec<u8>> {
    let fetch = async {
        let mut stream = TcpStream::connect(addr).await?;
        let mut pem = Vec::new();
        stream.read_to_end(&mut pem).await?;
        Ok::<_, std::io::Error>(pem)
    };
    let pem = tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| Error::connection(format!("bootstrap to {addr} timed out")))??;
    if pem.is_empty() {
        return Err(Error::connection(format!(
            "bootstrap to {addr} returned no certificate"
        )));
    }
    debug!(%addr, bytes = pem.len(), "fetched peer certificate");
    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &[u8] = b"-----BEGIN CERTIFICATE-----\nfake\n-----END CERTIFICATE-----\n";

    #[tokio::test]
    async fn serves_certificate_to_connecting_peer() {
        let server = CertificateServer::bind(0, CERT.to_vec()).await.unwrap();
        let addr = server.local_addr();

        let pem = fetch_certificate(addr, FETCH_TIMEOUT).await.unwrap();
        assert_eq!(pem, CERT);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn serves_concurrent_peers_independently() {
        let server = CertificateServer::bind(0, CERT.to_vec()).await.unwrap();
        let addr = server.local_addr();

        let fetches: Vec<_> = (0..8)
            .map(|_| tokio::spawn(fetch_certificate(addr, FETCH_TIMEOUT)))
            .collect();
        for fetch in fetches {
            assert_eq!(fetch.await.unwrap().unwrap(), CERT);
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn fetch_from_closed_port_errors() {
        let server = CertificateServer::bind(0, CERT.to_vec()).await.unwrap();
        let addr = server.local_addr();
        server.shutdown().await;

        let result = fetch_certificate(addr, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
