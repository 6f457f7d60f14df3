use patrol_rounds::RoundError;
use patrol_sync::SyncError;
use patrol_transport::TransportError;
use patrol_types::ErrorKind;
use patrol_verification::VerificationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("config error: {0}")]
    Config(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error(transparent)]
    Round(#[from] RoundError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::NotLoggedIn => ErrorKind::InvalidState,
            Self::Round(e) => e.kind(),
            Self::Verification(e) => e.kind(),
            Self::Transport(e) => e.kind(),
            Self::Sync(e) => e.kind(),
        }
    }
}
