use patrol_nfc::TagError;
use patrol_types::ErrorKind;
use thiserror::Error;

/// Failures while acquiring evidence. Verification decisions are not errors;
/// see [`crate::VerificationOutcome`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("timed out waiting for a location fix")]
    LocationTimeout,

    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("no NFC reader available on this device")]
    NoTagReader,

    #[error("tag read failed: {0}")]
    Tag(#[from] TagError),
}

impl VerificationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LocationTimeout => ErrorKind::Timeout,
            Self::LocationUnavailable(_) => ErrorKind::DeviceError,
            Self::NoTagReader => ErrorKind::HardwareUnavailable,
            Self::Tag(e) => e.kind(),
        }
    }
}
