use patrol_types::ErrorKind;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("NFC is not supported on this device")]
    UnsupportedHardware,

    #[error("NFC is disabled")]
    HardwareDisabled,

    #[error("timed out waiting for a tag")]
    Timeout,

    #[error("tag scan cancelled")]
    Cancelled,

    #[error("NFC session closed before a tag was read")]
    SessionClosed,

    #[error("NFC session error: {0}")]
    Session(String),
}

impl TagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedHardware | Self::HardwareDisabled => ErrorKind::HardwareUnavailable,
            Self::Timeout => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::SessionClosed | Self::Session(_) => ErrorKind::DeviceError,
        }
    }
}
