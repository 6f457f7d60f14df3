//! The HTTP round API as seen by the state machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use patrol_types::{
    Checkpoint, CheckpointId, CheckpointLog, ProofMethod, ProofPayload, Round, RoundId,
    RoundStatus, Timestamp,
};
use patrol_verification::Evidence;

use crate::ApiError;

/// Every server response: an authoritative timestamp plus the payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub timestamp: Timestamp,
    pub data: T,
}

/// A confirmed checkpoint visit as recorded by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerLog {
    #[serde(rename = "checkpointId")]
    pub checkpoint: CheckpointId,
    pub method: ProofMethod,
    pub timestamp: Timestamp,
}

/// Round detail as returned by start, end and fetch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundDetail {
    pub id: RoundId,
    pub name: String,
    pub status: RoundStatus,
    #[serde(default, rename = "startTimestamp")]
    pub start: Option<Timestamp>,
    #[serde(default, rename = "endTimestamp")]
    pub end: Option<Timestamp>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub logs: Vec<ServerLog>,
}

impl RoundDetail {
    /// Local representation: logs become confirmed, server-sourced logs.
    pub fn to_round(&self) -> Round {
        Round {
            id: self.id,
            name: self.name.clone(),
            start: self.start,
            end: self.end,
            status: self.status,
            checkpoints: self.checkpoints.iter().map(|c| c.id).collect(),
            logs: self
                .logs
                .iter()
                .map(|l| CheckpointLog::from_server(l.checkpoint, l.method, l.timestamp))
                .collect(),
        }
    }
}

/// Body of `POST /rounds/:id/checkpoints/:cpId`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckpointSubmission {
    #[serde(skip)]
    pub checkpoint: CheckpointId,
    pub method: ProofMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl CheckpointSubmission {
    pub fn from_evidence(checkpoint: CheckpointId, evidence: &Evidence) -> Self {
        Self::from_proof(checkpoint, evidence.method(), &evidence.to_proof())
    }

    /// Rebuild a submission from a stored log's proof (resubmission).
    pub fn from_proof(checkpoint: CheckpointId, method: ProofMethod, proof: &ProofPayload) -> Self {
        let mut submission = Self {
            checkpoint,
            method,
            lat: None,
            lon: None,
            code: None,
        };
        match proof {
            ProofPayload::Coordinates { point, .. } => {
                submission.lat = Some(point.lat);
                submission.lon = Some(point.lon);
            }
            ProofPayload::Code { code } => submission.code = Some(code.clone()),
            ProofPayload::Tag { uid, text } => {
                submission.code = Some(text.clone().unwrap_or_else(|| uid.clone()));
            }
            ProofPayload::Remote => {}
        }
        submission
    }
}

/// Round endpoints. Implemented over HTTP by [`crate::HttpRoundApi`].
#[async_trait]
pub trait RoundApi: Send + Sync {
    /// `POST /rounds/:id/start`
    async fn start_round(&self, round: RoundId) -> Result<Envelope<RoundDetail>, ApiError>;

    /// `POST /rounds/:id/end`
    async fn end_round(
        &self,
        round: RoundId,
        notes: Option<&str>,
    ) -> Result<Envelope<RoundDetail>, ApiError>;

    /// `POST /rounds/:id/checkpoints/:cpId`. Returns the server timestamp of
    /// the confirmed log.
    async fn submit_checkpoint(
        &self,
        round: RoundId,
        submission: &CheckpointSubmission,
    ) -> Result<Timestamp, ApiError>;

    /// `GET /rounds/:id`
    async fn fetch_round(&self, round: RoundId) -> Result<Envelope<RoundDetail>, ApiError>;
}
