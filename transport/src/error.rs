use patrol_types::ErrorKind;
use thiserror::Error;

use crate::Namespace;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Emit attempted while the namespace is not connected. Nothing is queued.
    #[error("{namespace} is not connected")]
    Disconnected { namespace: Namespace },

    #[error("connection to {namespace} was disposed")]
    Disposed { namespace: Namespace },

    #[error("no acknowledgement within the timeout")]
    AckTimeout,

    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The server refused the namespace handshake (bad or missing token).
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("link error: {0}")]
    Link(String),

    #[error("malformed packet: {0}")]
    Codec(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Disconnected { .. } | Self::Disposed { .. } => ErrorKind::Disconnected,
            Self::AckTimeout | Self::HandshakeTimeout => ErrorKind::Timeout,
            Self::Refused(_) => ErrorKind::ServerRejected,
            Self::Link(_) => ErrorKind::NetworkUnavailable,
            Self::Codec(_) => ErrorKind::DeviceError,
        }
    }
}
