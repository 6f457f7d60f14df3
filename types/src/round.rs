//! Patrol rounds and their lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CheckpointId, CheckpointLog, RoundId, Timestamp};

/// Lifecycle status of a round.
///
/// Transitions are monotonic: `NotStarted -> InProgress -> {Completed | Verified}`.
/// `Completed -> Verified` happens only on the server (supervisor action).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundStatus {
    NotStarted,
    InProgress,
    Completed,
    Verified,
}

impl RoundStatus {
    /// Position in the lifecycle, used to reject regressions.
    pub fn rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::InProgress => 1,
            Self::Completed => 2,
            Self::Verified => 3,
        }
    }

    /// Whether the client may move from `self` to `next`.
    pub fn can_transition_to(&self, next: RoundStatus) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Verified)
                | (Self::Completed, Self::Verified)
        )
    }

    /// Whether a server-reported status may overwrite `self`.
    pub fn accepts_server(&self, reported: RoundStatus) -> bool {
        reported.rank() >= self.rank()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Verified)
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Verified => "VERIFIED",
        };
        f.write_str(s)
    }
}

/// One patrol session across an ordered sequence of checkpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub name: String,
    #[serde(default)]
    pub start: Option<Timestamp>,
    #[serde(default)]
    pub end: Option<Timestamp>,
    pub status: RoundStatus,
    /// Checkpoints to visit, in patrol order.
    pub checkpoints: Vec<CheckpointId>,
    /// Verification records, in the order they were created.
    #[serde(default)]
    pub logs: Vec<CheckpointLog>,
}

impl Round {
    pub fn new(id: RoundId, name: impl Into<String>, checkpoints: Vec<CheckpointId>) -> Self {
        Self {
            id,
            name: name.into(),
            start: None,
            end: None,
            status: RoundStatus::NotStarted,
            checkpoints,
            logs: Vec::new(),
        }
    }

    pub fn contains(&self, checkpoint: CheckpointId) -> bool {
        self.checkpoints.contains(&checkpoint)
    }

    /// The confirmed log for a checkpoint. There is at most one.
    pub fn confirmed_log(&self, checkpoint: CheckpointId) -> Option<&CheckpointLog> {
        self.logs
            .iter()
            .find(|l| l.checkpoint == checkpoint && l.is_confirmed())
    }

    pub fn pending_log(&self, checkpoint: CheckpointId) -> Option<&CheckpointLog> {
        self.logs
            .iter()
            .find(|l| l.checkpoint == checkpoint && l.is_pending())
    }

    pub fn pending_log_mut(&mut self, checkpoint: CheckpointId) -> Option<&mut CheckpointLog> {
        self.logs
            .iter_mut()
            .find(|l| l.checkpoint == checkpoint && l.is_pending())
    }

    /// `(confirmed, total)` checkpoint counts.
    pub fn progress(&self) -> (usize, usize) {
        let confirmed = self
            .checkpoints
            .iter()
            .filter(|cp| self.confirmed_log(**cp).is_some())
            .count();
        (confirmed, self.checkpoints.len())
    }

    /// Whether every checkpoint has a confirmed log.
    pub fn is_complete(&self) -> bool {
        let (confirmed, total) = self.progress();
        confirmed == total
    }
}
