//! Checkpoints and the verification records logged against them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CheckpointId, GeoPoint, Timestamp};

/// A fixed physical point an operator must visit during a round.
///
/// Checkpoints are fetched independently of rounds and are immutable from
/// the client's perspective.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    /// Human-readable location label ("North gate", "Loading dock B").
    pub label: String,
    pub location: GeoPoint,
    /// Identifier bound to the checkpoint's QR code or NFC tag, if any.
    #[serde(default)]
    pub tag: Option<String>,
}

/// The mechanism used to prove physical presence at a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofMethod {
    Gps,
    Qr,
    Nfc,
}

impl ProofMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gps => "gps",
            Self::Qr => "qr",
            Self::Nfc => "nfc",
        }
    }
}

impl fmt::Display for ProofMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw proof attached to a checkpoint log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProofPayload {
    Coordinates { point: GeoPoint, accuracy_m: f64 },
    Code { code: String },
    Tag { uid: String, text: Option<String> },
    /// Proof held only by the server (logged from another device).
    Remote,
}

/// Why a checkpoint log ended up rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The server refused the log (duplicate, expired round, tag mismatch).
    ServerRejected { message: String },
    /// The log was never acknowledged within the submission retry budget.
    RetryBudgetExhausted { attempts: u32 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerRejected { message } => write!(f, "rejected by server: {message}"),
            Self::RetryBudgetExhausted { attempts } => {
                write!(f, "not acknowledged after {attempts} attempts")
            }
        }
    }
}

/// Lifecycle status of a checkpoint log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LogStatus {
    /// Verified locally, not yet acknowledged by the server.
    Pending,
    /// Acknowledged by the server.
    Confirmed,
    /// Rejected by the server or abandoned.
    Rejected(RejectionReason),
}

/// One verification record for a checkpoint within a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointLog {
    pub checkpoint: CheckpointId,
    pub method: ProofMethod,
    /// When the device observed the proof. Informational only.
    pub observed_at: Timestamp,
    /// Authoritative timestamp, set once the server acknowledged the log.
    pub server_at: Option<Timestamp>,
    pub status: LogStatus,
    pub proof: ProofPayload,
    /// Number of submission attempts that failed to reach the server.
    #[serde(default)]
    pub attempts: u32,
}

impl CheckpointLog {
    /// Create a pending log for proof that passed local verification.
    pub fn pending(
        checkpoint: CheckpointId,
        method: ProofMethod,
        proof: ProofPayload,
        observed_at: Timestamp,
    ) -> Self {
        Self {
            checkpoint,
            method,
            observed_at,
            server_at: None,
            status: LogStatus::Pending,
            proof,
            attempts: 0,
        }
    }

    /// A confirmed log the server reported without a local counterpart.
    pub fn from_server(
        checkpoint: CheckpointId,
        method: ProofMethod,
        server_at: Timestamp,
    ) -> Self {
        Self {
            checkpoint,
            method,
            observed_at: server_at,
            server_at: Some(server_at),
            status: LogStatus::Confirmed,
            proof: ProofPayload::Remote,
            attempts: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == LogStatus::Pending
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == LogStatus::Confirmed
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.status, LogStatus::Rejected(_))
    }

    /// Mark the log confirmed with the server's timestamp.
    pub fn confirm(&mut self, server_at: Timestamp) {
        self.status = LogStatus::Confirmed;
        self.server_at = Some(server_at);
    }

    pub fn reject(&mut self, reason: RejectionReason) {
        self.status = LogStatus::Rejected(reason);
    }
}
