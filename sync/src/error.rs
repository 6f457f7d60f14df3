use patrol_rounds::RoundError;
use patrol_types::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("coordinator is detached")]
    Detached,

    #[error(transparent)]
    Round(#[from] RoundError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Detached => ErrorKind::InvalidState,
            Self::Round(e) => e.kind(),
        }
    }
}
