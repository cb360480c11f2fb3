//! Error types for infnoise-core.

use thiserror::Error;

/// Every failure the driver can report.
///
/// `Error` is `Clone` because a terminal drain fault is delivered to every
/// reader parked on the transport, not just the first one to wake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No hardware with the requested USB ids was found at open time.
    #[error("device {vendor_id:#06x}:{product_id:#06x} not found")]
    NotFound { vendor_id: u16, product_id: u16 },

    /// Transport failure: short transfer, failed control request, stall.
    /// `status` carries the platform's own status text or code.
    #[error("{op} failed: {status}")]
    Io { op: &'static str, status: String },

    /// Wire framing can no longer be trusted (ring overflow, partial decode
    /// group, read past buffered payload).
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// Operation attempted before `Device::start`.
    #[error("device not started")]
    NotStarted,

    /// Operation attempted after close, or the background drain hit a
    /// terminal hardware error.
    #[error("device closed")]
    Closed,

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn io(op: &'static str, status: impl ToString) -> Self {
        Self::Io {
            op,
            status: status.to_string(),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { .. } => std::io::Error::new(std::io::ErrorKind::NotFound, err),
            Error::Closed | Error::NotStarted => {
                std::io::Error::new(std::io::ErrorKind::NotConnected, err)
            }
            other => std::io::Error::other(other),
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
