use patrol_types::{CheckpointId, ErrorKind, RoundId, RoundStatus};
use patrol_verification::RejectReason;
use thiserror::Error;

/// Failures at the HTTP boundary.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("request timed out")]
    Timeout,

    #[error("not authenticated")]
    Unauthorized,

    /// Authoritative refusal (duplicate log, expired round, tag mismatch).
    #[error("rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("server error: HTTP {status}")]
    Http { status: u16 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkUnavailable(_) | Self::Http { .. } | Self::InvalidResponse(_) => {
                ErrorKind::NetworkUnavailable
            }
            Self::Timeout => ErrorKind::Timeout,
            Self::Unauthorized | Self::Rejected { .. } => ErrorKind::ServerRejected,
        }
    }
}

#[derive(Debug, Error)]
pub enum RoundError {
    #[error("no active round")]
    NoActiveRound,

    #[error("cannot {op} while round is {status}")]
    InvalidState {
        op: &'static str,
        status: RoundStatus,
    },

    #[error("round {requested} is not the active round ({active})")]
    RoundMismatch { active: RoundId, requested: RoundId },

    #[error("round {0} was discarded while the request was in flight")]
    Discarded(RoundId),

    #[error("checkpoint {0} is not part of the active round")]
    NotInRound(CheckpointId),

    #[error("checkpoint {0} details are unknown")]
    UnknownCheckpoint(CheckpointId),

    #[error("checkpoint {0} is already confirmed")]
    AlreadyConfirmed(CheckpointId),

    #[error("checkpoint {0} already has a pending submission")]
    AlreadyPending(CheckpointId),

    #[error("verification rejected: {0}")]
    Verification(RejectReason),

    #[error("checkpoint {checkpoint} rejected by server: {message}")]
    ServerRejected {
        checkpoint: CheckpointId,
        message: String,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl RoundError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoActiveRound
            | Self::InvalidState { .. }
            | Self::RoundMismatch { .. }
            | Self::Discarded(_)
            | Self::NotInRound(_)
            | Self::UnknownCheckpoint(_) => ErrorKind::InvalidState,
            Self::AlreadyConfirmed(_) => ErrorKind::ServerRejected,
            Self::AlreadyPending(_) => ErrorKind::AlreadyPending,
            Self::Verification(reason) => reason.kind(),
            Self::ServerRejected { .. } => ErrorKind::ServerRejected,
            Self::Api(e) => e.kind(),
        }
    }
}
