//! Device configuration passed explicitly to every component that needs it.
//!
//! There is deliberately no global settings state: discovery, bootstrap, and
//! transfer components each receive a [`DeviceConfig`] value at construction
//! time. Persistence of these values is the embedder's concern, behind
//! [`SettingsProvider`].

use std::path::PathBuf;

use crate::pb;

/// mDNS service type shared by all peers.
pub const SERVICE_TYPE: &str = "_warpinator._tcp.local.";

/// Default port for the TLS transfer/registration server.
pub const DEFAULT_TRANSFER_PORT: u16 = 42000;

/// Default port for the insecure certificate bootstrap listener.
pub const DEFAULT_AUTH_PORT: u16 = 42001;

/// Protocol revision this crate speaks.
pub const API_VERSION: &str = "2";

/// Api version assumed for records that do not advertise one.
pub const FALLBACK_API_VERSION: &str = "1";

/// Auth port assumed for records that do not advertise one. Matches the
/// port a v1 peer would expose.
pub const FALLBACK_AUTH_PORT: u16 = 42000;

/// Everything a lanbeam instance needs to know about itself.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Stable unique device id; doubles as the mDNS instance name.
    pub device_id: String,
    /// Human-facing device name.
    pub display_name: String,
    /// Hostname announced in the discovery record and certificate.
    pub hostname: String,
    /// Local account name shown to peers.
    pub username: String,
    /// Port for the TLS transfer/registration server.
    pub transfer_port: u16,
    /// Port for the insecure certificate bootstrap listener.
    pub auth_port: u16,
    /// Directory incoming items are written under.
    pub download_dir: PathBuf,
    /// Grant incoming offers without asking.
    pub auto_accept: bool,
    /// Replace existing files instead of renaming incoming ones.
    pub overwrite: bool,
}

impl DeviceConfig {
    /// Create a config with default ports and policies.
    pub fn new(
        device_id: impl Into<String>,
        display_name: impl Into<String>,
        hostname: impl Into<String>,
        username: impl Into<String>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            display_name: display_name.into(),
            hostname: hostname.into(),
            username: username.into(),
            transfer_port: DEFAULT_TRANSFER_PORT,
            auth_port: DEFAULT_AUTH_PORT,
            download_dir: download_dir.into(),
            auto_accept: false,
            overwrite: false,
        }
    }

    /// The registration payload describing this device.
    pub fn device_info(&self) -> pb::DeviceInfo {
        pb::DeviceInfo {
            id: self.device_id.clone(),
            display_name: self.display_name.clone(),
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            api_version: API_VERSION.to_string(),
        }
    }
}

/// Seam for the (out-of-scope) settings persistence layer.
pub trait SettingsProvider: Send + Sync + 'static {
    /// Current settings snapshot.
    fn device_config(&self) -> DeviceConfig;
}
