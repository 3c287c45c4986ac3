//! LAN file sharing core: mDNS presence, trust-on-first-use certificate
//! bootstrap, and chunked file/folder transfer over gRPC with TLS.
//!
//! A device announces itself on the local network, browses for peers,
//! exchanges certificates over an insecure bootstrap port, opens a secure
//! channel, and moves files with progress tracking, cancellation, and
//! retry. Presentation is out of scope: the crate exposes an event bus and
//! snapshot queries, and never assumes a UI context.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod remote;
pub mod server;
pub mod transfer;

/// Generated wire protocol types.
#[allow(missing_docs)]
pub mod pb {
    tonic::include_proto!("lanbeam");
}

// Re-export key types
pub use config::{DeviceConfig, SettingsProvider};
pub use discovery::DiscoveryEvent;
pub use error::{Error, Result};
pub use events::{Event, EventBus, OperationId, RemoteId};
pub use identity::{CredentialProvider, Identity};
pub use remote::{ConnectionStatus, Remote, RemoteDetails, RemoteRegistry};
pub use server::{LanbeamServer, ServerGuard};
pub use transfer::{
    Direction, FileSink, FileSource, OperationSnapshot, ReceivingOperation, SendingOperation,
    TransferStatus,
};
