//! Watches the network for peer discovery records.
//!
//! Flush placeholders and this device's own record never surface; everything
//! else is parsed into a [`DiscoveryEvent`] with documented fallbacks for
//! missing or malformed TXT properties, so a sloppy peer record degrades
//! gracefully instead of erroring.

use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{DiscoveryEvent, RECORD_FLUSH, TXT_API_VERSION, TXT_AUTH_PORT, TXT_HOSTNAME, TXT_TYPE};
use crate::config::{DeviceConfig, FALLBACK_API_VERSION, FALLBACK_AUTH_PORT, SERVICE_TYPE};
use crate::error::Result;
use crate::events::{Event, EventBus};

/// Pause before recreating the daemon after a transient failure.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Transient failures tolerated before the browser gives up.
const MAX_RESTARTS: u32 = 5;

/// Browses for peer records and reports sightings.
pub struct ServiceBrowser {
    daemon: ServiceDaemon,
    receiver: mdns_sd::Receiver<ServiceEvent>,
}

/// What one pass of the browse loop decided.
enum Step {
    Shutdown,
    Handled,
    DaemonLost,
}

impl ServiceBrowser {
    /// Create a browser with a fresh mDNS daemon and start browsing.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        let receiver = daemon.browse(SERVICE_TYPE)?;
        Ok(Self { daemon, receiver })
    }

    /// Stop browsing and shut the daemon down.
    pub fn stop(self) {
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!("stop_browse skipped: {e}");
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {e}");
        }
    }

    /// Spawn the background browse task. Sightings are delivered on `tx`;
    /// non-recoverable failures surface on the event bus.
    pub fn spawn(
        config: DeviceConfig,
        events: EventBus,
        tx: mpsc::Sender<DiscoveryEvent>,
    ) -> BrowserHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run(config, events, tx, shutdown_rx));
        BrowserHandle {
            shutdown_tx,
            handle,
        }
    }

    async fn step(
        &self,
        config: &DeviceConfig,
        tx: &mpsc::Sender<DiscoveryEvent>,
    ) -> Step {
        let received = match self.receiver.recv_async().await {
            Ok(event) => event,
            // Channel gone means the daemon itself died.
            Err(_) => return Step::DaemonLost,
        };
        match received {
            ServiceEvent::ServiceResolved(info) => {
                if let Some(event) = parse_record(&info, &config.device_id) {
                    debug!(peer = %event.peer_id, "peer record resolved");
                    if tx.send(event).await.is_err() {
                        return Step::Shutdown;
                    }
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                debug!(%fullname, "peer record removed");
            }
            other => trace!("browse event: {other:?}"),
        }
        Step::Handled
    }
}

async fn run(
    config: DeviceConfig,
    events: EventBus,
    tx: mpsc::Sender<DiscoveryEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut failures = 0u32;
    'restart: loop {
        let browser = match ServiceBrowser::new() {
            Ok(browser) => browser,
            Err(e) => {
                failures += 1;
                if failures > MAX_RESTARTS {
                    events.emit(Event::DiscoveryFailed {
                        component: "browser",
                        reason: e.to_string(),
                    });
                    return;
                }
                warn!("mDNS daemon unavailable, retrying: {e}");
                tokio::time::sleep(RESTART_DELAY).await;
                continue;
            }
        };

        loop {
            let step = tokio::select! {
                _ = shutdown_rx.recv() => Step::Shutdown,
                step = browser.step(&config, &tx) => step,
            };
            match step {
                Step::Shutdown => {
                    browser.stop();
                    return;
                }
                Step::Handled => failures = 0,
                Step::DaemonLost => {
                    failures += 1;
                    browser.stop();
                    if failures > MAX_RESTARTS {
                        events.emit(Event::DiscoveryFailed {
                            component: "browser",
                            reason: "mDNS daemon channel closed".to_string(),
                        });
                        return;
                    }
                    warn!("browse channel lost, restarting");
                    tokio::time::sleep(RESTART_DELAY).await;
                    continue 'restart;
                }
            }
        }
    }
}

/// Parse a resolved record into a sighting. Returns `None` for flush
/// placeholders and for this device's own record.
fn parse_record(info: &ServiceInfo, local_id: &str) -> Option<DiscoveryEvent> {
    if info.get_property_val_str(TXT_TYPE) == Some(RECORD_FLUSH) {
        trace!(fullname = info.get_fullname(), "ignoring flush record");
        return None;
    }

    let peer_id = instance_name(info.get_fullname())?.to_string();
    if peer_id == local_id {
        trace!("ignoring our own record");
        return None;
    }

    let hostname = info
        .get_property_val_str(TXT_HOSTNAME)
        .unwrap_or(&peer_id)
        .to_string();
    let api_version = info
        .get_property_val_str(TXT_API_VERSION)
        .unwrap_or(FALLBACK_API_VERSION)
        .to_string();
    let auth_port = info
        .get_property_val_str(TXT_AUTH_PORT)
        .and_then(|p| p.parse().ok())
        .unwrap_or(FALLBACK_AUTH_PORT);
    let address = info.get_addresses().iter().next().copied();

    Some(DiscoveryEvent {
        peer_id,
        hostname,
        address,
        transfer_port: info.get_port(),
        auth_port,
        api_version,
    })
}

fn instance_name(fullname: &str) -> Option<&str> {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .and_then(|prefix| prefix.strip_suffix('.'))
}

/// Handle for the background browse task.
pub struct BrowserHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl BrowserHandle {
    /// Stop browsing and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::API_VERSION;
    use crate::discovery::RECORD_REAL;

    fn record(instance: &str, properties: HashMap<String, String>) -> ServiceInfo {
        ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            "peerhost.local.",
            "192.168.1.20",
            42000,
            properties,
        )
        .unwrap()
    }

    fn full_properties() -> HashMap<String, String> {
        HashMap::from([
            (TXT_HOSTNAME.to_string(), "peerhost".to_string()),
            (TXT_AUTH_PORT.to_string(), "42001".to_string()),
            (TXT_API_VERSION.to_string(), API_VERSION.to_string()),
            (TXT_TYPE.to_string(), RECORD_REAL.to_string()),
        ])
    }

    #[test]
    fn parses_complete_record() {
        let info = record("dev-peer", full_properties());
        let event = parse_record(&info, "dev-local").unwrap();
        assert_eq!(event.peer_id, "dev-peer");
        assert_eq!(event.hostname, "peerhost");
        assert_eq!(event.auth_port, 42001);
        assert_eq!(event.transfer_port, 42000);
        assert_eq!(event.api_version, API_VERSION);
        assert_eq!(event.address, Some("192.168.1.20".parse().unwrap()));
    }

    #[test]
    fn flush_records_are_ignored() {
        let mut properties = full_properties();
        properties.insert(TXT_TYPE.to_string(), RECORD_FLUSH.to_string());
        let info = record("dev-peer", properties);
        assert!(parse_record(&info, "dev-local").is_none());
    }

    #[test]
    fn own_record_is_ignored() {
        let info = record("dev-local", full_properties());
        assert!(parse_record(&info, "dev-local").is_none());
    }

    #[test]
    fn missing_properties_fall_back_to_defaults() {
        let info = record("dev-bare", HashMap::new());
        let event = parse_record(&info, "dev-local").unwrap();
        assert_eq!(event.hostname, "dev-bare");
        assert_eq!(event.api_version, FALLBACK_API_VERSION);
        assert_eq!(event.auth_port, FALLBACK_AUTH_PORT);
    }

    #[test]
    fn garbled_auth_port_falls_back() {
        let mut properties = full_properties();
        properties.insert(TXT_AUTH_PORT.to_string(), "not-a-port".to_string());
        let info = record("dev-peer", properties);
        let event = parse_record(&info, "dev-local").unwrap();
        assert_eq!(event.auth_port, FALLBACK_AUTH_PORT);
    }

    #[test]
    fn instance_name_strips_service_suffix() {
        assert_eq!(
            instance_name(&format!("dev-x.{SERVICE_TYPE}")),
            Some("dev-x")
        );
        assert_eq!(instance_name("garbage"), None);
    }
}
