//! Identity snapshot of a peer device.

use std::net::IpAddr;

use crate::config::{DEFAULT_TRANSFER_PORT, FALLBACK_API_VERSION, FALLBACK_AUTH_PORT};
use crate::discovery::DiscoveryEvent;
use crate::pb;

/// Connection lifecycle of a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Known but not connected; a fresh discovery event triggers a connect.
    Disconnected,
    /// Bootstrap, TLS, and registration are in progress.
    Connecting,
    /// Secure channel open and registration complete.
    Connected,
    /// Explicitly disconnected; reconnects only on request.
    Idle,
    /// The last connection attempt failed; see `last_error`.
    Error,
}

/// Everything this device knows about one peer. Mutated only by the
/// registry and the connection state machine.
#[derive(Debug, Clone)]
pub struct RemoteDetails {
    /// The peer's unique device id.
    pub id: String,
    /// Human-facing device name, learned during registration.
    pub display_name: String,
    /// The peer's hostname.
    pub hostname: String,
    /// The peer's account name, learned during registration.
    pub username: String,
    /// Last known network address.
    pub address: Option<IpAddr>,
    /// Protocol revision the peer speaks.
    pub api_version: String,
    /// Port of the peer's TLS transfer server.
    pub transfer_port: u16,
    /// Port of the peer's certificate bootstrap listener.
    pub auth_port: u16,
    /// Current connection status.
    pub status: ConnectionStatus,
    /// Reason for the most recent `Error` status, if any.
    pub last_error: Option<String>,
    /// Raw avatar bytes, carried for the presentation layer and never
    /// interpreted here.
    pub avatar: Option<Vec<u8>>,
}

impl RemoteDetails {
    /// Details for a peer first seen through discovery.
    pub fn from_discovery(event: &DiscoveryEvent) -> Self {
        Self {
            id: event.peer_id.clone(),
            display_name: event.hostname.clone(),
            hostname: event.hostname.clone(),
            username: String::new(),
            address: event.address,
            api_version: event.api_version.clone(),
            transfer_port: event.transfer_port,
            auth_port: event.auth_port,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            avatar: None,
        }
    }

    /// Details for a peer first seen through an inbound registration (it
    /// found us before we found it). No address is known yet; discovery
    /// fills that in.
    pub fn from_registration(info: &pb::DeviceInfo) -> Self {
        let mut details = Self {
            id: info.id.clone(),
            display_name: String::new(),
            hostname: String::new(),
            username: String::new(),
            address: None,
            api_version: String::new(),
            transfer_port: DEFAULT_TRANSFER_PORT,
            auth_port: FALLBACK_AUTH_PORT,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            avatar: None,
        };
        details.apply_registration(info);
        details
    }

    /// Refresh the network endpoint from a new discovery sighting.
    pub fn apply_discovery(&mut self, event: &DiscoveryEvent) {
        if event.address.is_some() {
            self.address = event.address;
        }
        self.hostname = event.hostname.clone();
        self.transfer_port = event.transfer_port;
        self.auth_port = event.auth_port;
        self.api_version = event.api_version.clone();
    }

    /// Merge metadata from a registration exchange. Missing fields keep
    /// their documented fallbacks instead of erasing known values.
    pub fn apply_registration(&mut self, info: &pb::DeviceInfo) {
        if !info.hostname.is_empty() {
            self.hostname = info.hostname.clone();
        } else if self.hostname.is_empty() {
            self.hostname = info.id.clone();
        }
        self.display_name = if info.display_name.is_empty() {
            self.hostname.clone()
        } else {
            info.display_name.clone()
        };
        if !info.username.is_empty() {
            self.username = info.username.clone();
        }
        self.api_version = if info.api_version.is_empty() {
            if self.api_version.is_empty() {
                FALLBACK_API_VERSION.to_string()
            } else {
                self.api_version.clone()
            }
        } else {
            info.api_version.clone()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting() -> DiscoveryEvent {
        DiscoveryEvent {
            peer_id: "dev-peer".into(),
            hostname: "peerhost".into(),
            address: Some("192.168.1.20".parse().unwrap()),
            transfer_port: 42000,
            auth_port: 42001,
            api_version: "2".into(),
        }
    }

    #[test]
    fn discovery_seeds_disconnected_details() {
        let details = RemoteDetails::from_discovery(&sighting());
        assert_eq!(details.status, ConnectionStatus::Disconnected);
        assert_eq!(details.display_name, "peerhost");
        assert!(details.username.is_empty());
    }

    #[test]
    fn registration_fills_missing_fields_with_fallbacks() {
        let mut details = RemoteDetails::from_discovery(&sighting());
        details.apply_registration(&pb::DeviceInfo {
            id: "dev-peer".into(),
            display_name: String::new(),
            hostname: String::new(),
            username: "alice".into(),
            api_version: String::new(),
        });
        // Display name falls back to the hostname, api version is kept.
        assert_eq!(details.display_name, "peerhost");
        assert_eq!(details.username, "alice");
        assert_eq!(details.api_version, "2");
    }

    #[test]
    fn registration_from_unknown_peer_defaults_api_version() {
        let details = RemoteDetails::from_registration(&pb::DeviceInfo {
            id: "dev-new".into(),
            display_name: "New Device".into(),
            hostname: "newhost".into(),
            username: "bob".into(),
            api_version: String::new(),
        });
        assert_eq!(details.api_version, FALLBACK_API_VERSION);
        assert_eq!(details.display_name, "New Device");
        assert_eq!(details.auth_port, FALLBACK_AUTH_PORT);
    }

    #[test]
    fn rediscovery_refreshes_endpoint() {
        let mut details = RemoteDetails::from_discovery(&sighting());
        let mut event = sighting();
        event.address = Some("192.168.1.99".parse().unwrap());
        event.auth_port = 43001;
        details.apply_discovery(&event);
        assert_eq!(details.address, Some("192.168.1.99".parse().unwrap()));
        assert_eq!(details.auth_port, 43001);
    }
}
