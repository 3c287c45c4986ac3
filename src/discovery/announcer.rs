//! Publishes this device's discovery record.
//!
//! Publishing is a two-phase cycle: withdraw whatever record exists, wait,
//! publish a `"flush"` placeholder, wait again, then publish the real
//! record. Discovery caches on other devices may otherwise keep serving a
//! stale record after this device's address or port changed (typically
//! after a restart); the distinct flush record forces them to drop it. The
//! delays are part of the protocol, not tuning knobs.

use std::collections::HashMap;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RECORD_FLUSH, RECORD_REAL, TXT_API_VERSION, TXT_AUTH_PORT, TXT_HOSTNAME, TXT_TYPE};
use crate::config::{DeviceConfig, API_VERSION, SERVICE_TYPE};
use crate::error::Result;
use crate::events::{Event, EventBus};

/// Pause between the phases of the flush cycle.
pub const FLUSH_DELAY: Duration = Duration::from_secs(2);

/// Pause before recreating the daemon after a transient failure.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Transient failures tolerated before the announcer gives up and surfaces
/// a [`Event::DiscoveryFailed`].
const MAX_RESTARTS: u32 = 5;

/// Owns the mDNS daemon registration for this device.
pub struct ServiceAnnouncer {
    config: DeviceConfig,
    daemon: ServiceDaemon,
}

impl ServiceAnnouncer {
    /// Create an announcer with a fresh mDNS daemon.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self { config, daemon })
    }

    /// Run the full flush-then-republish cycle.
    pub async fn announce(&self) -> Result<()> {
        self.withdraw();
        tokio::time::sleep(FLUSH_DELAY).await;

        debug!(device_id = %self.config.device_id, "publishing flush record");
        self.daemon.register(flush_record(&self.config)?)?;
        tokio::time::sleep(FLUSH_DELAY).await;

        self.withdraw();
        self.daemon.register(real_record(&self.config)?)?;
        info!(
            device_id = %self.config.device_id,
            port = self.config.transfer_port,
            "discovery record published"
        );
        Ok(())
    }

    /// Unpublish this device's record. Missing registrations are not an
    /// error; the withdraw is best-effort by nature.
    pub fn withdraw(&self) {
        if let Err(e) = self.daemon.unregister(&fullname(&self.config)) {
            debug!("unregister skipped: {e}");
        }
    }

    /// Withdraw and stop the underlying daemon.
    pub fn stop(self) {
        self.withdraw();
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {e}");
        }
    }

    /// Spawn the background announce task. The record is withdrawn again on
    /// [`AnnouncerHandle::shutdown`].
    pub fn spawn(config: DeviceConfig, events: EventBus) -> AnnouncerHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run(config, events, shutdown_rx));
        AnnouncerHandle {
            shutdown_tx,
            handle,
        }
    }
}

async fn run(config: DeviceConfig, events: EventBus, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut failures = 0u32;
    loop {
        let announcer = match ServiceAnnouncer::new(config.clone()) {
            Ok(announcer) => announcer,
            Err(e) => {
                failures += 1;
                if failures > MAX_RESTARTS {
                    events.emit(Event::DiscoveryFailed {
                        component: "announcer",
                        reason: e.to_string(),
                    });
                    return;
                }
                warn!("mDNS daemon unavailable, retrying: {e}");
                tokio::time::sleep(RESTART_DELAY).await;
                continue;
            }
        };

        let outcome = tokio::select! {
            _ = shutdown_rx.recv() => None,
            result = announcer.announce() => Some(result),
        };
        match outcome {
            // Shutdown requested mid-cycle.
            None => {
                announcer.stop();
                return;
            }
            Some(Ok(())) => {
                failures = 0;
                // Stay registered until told to stop.
                let _ = shutdown_rx.recv().await;
                announcer.stop();
                return;
            }
            Some(Err(e)) => {
                failures += 1;
                announcer.stop();
                if failures > MAX_RESTARTS {
                    events.emit(Event::DiscoveryFailed {
                        component: "announcer",
                        reason: e.to_string(),
                    });
                    return;
                }
                warn!("announce failed, restarting: {e}");
                tokio::time::sleep(RESTART_DELAY).await;
            }
        }
    }
}

fn fullname(config: &DeviceConfig) -> String {
    format!("{}.{}", config.device_id, SERVICE_TYPE)
}

fn host_fullname(config: &DeviceConfig) -> String {
    format!("{}.local.", config.hostname)
}

fn real_record(config: &DeviceConfig) -> Result<ServiceInfo> {
    let properties = HashMap::from([
        (TXT_HOSTNAME.to_string(), config.hostname.clone()),
        (TXT_AUTH_PORT.to_string(), config.auth_port.to_string()),
        (TXT_API_VERSION.to_string(), API_VERSION.to_string()),
        (TXT_TYPE.to_string(), RECORD_REAL.to_string()),
    ]);
    let info = ServiceInfo::new(
        SERVICE_TYPE,
        &config.device_id,
        &host_fullname(config),
        "",
        config.transfer_port,
        properties,
    )?;
    Ok(info.enable_addr_auto())
}

fn flush_record(config: &DeviceConfig) -> Result<ServiceInfo> {
    // Deliberately minimal: only the hostname and the flush marker.
    let properties = HashMap::from([
        (TXT_HOSTNAME.to_string(), config.hostname.clone()),
        (TXT_TYPE.to_string(), RECORD_FLUSH.to_string()),
    ]);
    let info = ServiceInfo::new(
        SERVICE_TYPE,
        &config.device_id,
        &host_fullname(config),
        "",
        config.transfer_port,
        properties,
    )?;
    Ok(info.enable_addr_auto())
}

/// Handle for the background announce task.
pub struct AnnouncerHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl AnnouncerHandle {
    /// Withdraw the record and stop the task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_AUTH_PORT;

    fn config() -> DeviceConfig {
        DeviceConfig::new("dev-ann", "Announcer", "annhost", "tester", "/tmp/downloads")
    }

    #[test]
    fn real_record_carries_full_property_map() {
        let record = real_record(&config()).unwrap();
        assert_eq!(record.get_property_val_str(TXT_TYPE), Some(RECORD_REAL));
        assert_eq!(record.get_property_val_str(TXT_HOSTNAME), Some("annhost"));
        assert_eq!(
            record.get_property_val_str(TXT_API_VERSION),
            Some(API_VERSION)
        );
        let auth_port = DEFAULT_AUTH_PORT.to_string();
        assert_eq!(
            record.get_property_val_str(TXT_AUTH_PORT),
            Some(auth_port.as_str())
        );
    }

    #[test]
    fn flush_record_is_marked_flush() {
        let record = flush_record(&config()).unwrap();
        assert_eq!(record.get_property_val_str(TXT_TYPE), Some(RECORD_FLUSH));
        assert_eq!(record.get_property_val_str(TXT_API_VERSION), None);
    }

    #[test]
    fn fullname_is_instance_dot_service_type() {
        assert_eq!(fullname(&config()), format!("dev-ann.{SERVICE_TYPE}"));
    }
}
