//! Notifications published by the round machine.

use patrol_types::{CheckpointId, RejectionReason, Round, RoundId, RoundStatus, Timestamp};

#[derive(Clone, Debug, PartialEq)]
pub enum RoundEvent {
    /// A round became the active round (started, restored or superseding).
    Installed { round: Round },
    StatusChanged {
        round: RoundId,
        status: RoundStatus,
    },
    CheckpointPending {
        round: RoundId,
        checkpoint: CheckpointId,
    },
    CheckpointConfirmed {
        round: RoundId,
        checkpoint: CheckpointId,
        server_at: Timestamp,
        progress: (usize, usize),
    },
    CheckpointRejected {
        round: RoundId,
        checkpoint: CheckpointId,
        reason: RejectionReason,
    },
    /// The active round was dropped (logout).
    Discarded { round: RoundId },
}
