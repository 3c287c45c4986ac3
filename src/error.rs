//! Error types for lanbeam.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// mDNS daemon error.
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    /// Certificate generation error.
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// Tonic transport error.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// gRPC call failed with a status.
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk named a path other than the sink's negotiated path.
    #[error("FILENAME_MISMATCH: expected {expected:?}, got {actual:?}")]
    FilenameMismatch {
        /// Path the sink was negotiated for.
        expected: String,
        /// Path the offending chunk declared.
        actual: String,
    },

    /// The peer denied a transfer offer.
    #[error("transfer denied by peer")]
    Denied,

    /// Receive-direction operations can only be restarted by the sender.
    #[error("retry is only permitted for send-direction operations")]
    RetryNotPermitted,

    /// No operation with this id is known.
    #[error("unknown operation {0}")]
    UnknownOperation(u64),

    /// No remote with this id is known.
    #[error("unknown remote {0:?}")]
    UnknownRemote(String),

    /// The requested state transition is not allowed.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    /// Discovery infrastructure failed beyond recovery.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a discovery error.
    pub fn discovery<S: Into<String>>(msg: S) -> Self {
        Self::Discovery(msg.into())
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::FilenameMismatch { .. } => tonic::Status::failed_precondition(err.to_string()),
            Error::Denied => tonic::Status::permission_denied(err.to_string()),
            Error::RetryNotPermitted => tonic::Status::failed_precondition(err.to_string()),
            Error::UnknownOperation(_) | Error::UnknownRemote(_) => {
                tonic::Status::not_found(err.to_string())
            }
            Error::Rpc(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
