//! Nullable round API: An in-memory patrol backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use patrol_rounds::{
    ApiError, CheckpointSubmission, Envelope, RoundApi, RoundDetail, ServerLog,
};
use patrol_types::{Checkpoint, CheckpointId, GeoPoint, RoundId, RoundStatus, Timestamp};
use tokio::sync::watch;

/// Server clock origin. Each server-side event advances it by one second.
const SERVER_EPOCH_MS: u64 = 1_700_000_000_000;
const SERVER_TICK_MS: u64 = 1_000;

/// A checkpoint with tag `CP-<id>`.
pub fn checkpoint(id: u64, lat: f64, lon: f64) -> Checkpoint {
    Checkpoint {
        id: CheckpointId::new(id),
        label: format!("Checkpoint {id}"),
        location: GeoPoint::new(lat, lon),
        tag: Some(format!("CP-{id}")),
    }
}

/// A not-yet-started round over the given checkpoints.
pub fn round_detail(id: u64, checkpoints: Vec<Checkpoint>) -> RoundDetail {
    RoundDetail {
        id: RoundId::new(id),
        name: format!("Round {id}"),
        status: RoundStatus::NotStarted,
        start: None,
        end: None,
        checkpoints,
        logs: Vec::new(),
    }
}

/// A request received by [`NullRoundApi`].
#[derive(Clone, Debug, PartialEq)]
pub enum ApiCall {
    Start(RoundId),
    End {
        round: RoundId,
        notes: Option<String>,
    },
    Submit {
        round: RoundId,
        submission: CheckpointSubmission,
    },
    Fetch(RoundId),
}

#[derive(Default)]
struct Backend {
    rounds: HashMap<RoundId, RoundDetail>,
    ticks: u64,
    calls: Vec<ApiCall>,
    start_failures: VecDeque<ApiError>,
    end_failures: VecDeque<ApiError>,
    fetch_failures: VecDeque<ApiError>,
    submit_failures: VecDeque<ApiError>,
}

impl Backend {
    fn tick(&mut self) -> Timestamp {
        self.ticks += 1;
        Timestamp::new(SERVER_EPOCH_MS + self.ticks * SERVER_TICK_MS)
    }

    fn envelope(&mut self, round: RoundId) -> Result<Envelope<RoundDetail>, ApiError> {
        let timestamp = self.tick();
        let data = self.rounds.get(&round).cloned().ok_or_else(|| not_found(round))?;
        Ok(Envelope { timestamp, data })
    }
}

fn not_found(round: RoundId) -> ApiError {
    ApiError::Rejected {
        status: 404,
        message: format!("round {round} not found"),
    }
}

/// An in-memory backend with scripted failures.
///
/// Without scripted failures it behaves like the real server: starting sets
/// `IN_PROGRESS`, ending sets `COMPLETED`, a submission records a server log
/// and a second submission for the same checkpoint is rejected with 409.
pub struct NullRoundApi {
    backend: Mutex<Backend>,
    held: watch::Sender<bool>,
    starts_held: watch::Sender<bool>,
}

impl NullRoundApi {
    pub fn new() -> Self {
        let (held, _) = watch::channel(false);
        let (starts_held, _) = watch::channel(false);
        Self {
            backend: Mutex::new(Backend::default()),
            held,
            starts_held,
        }
    }

    pub fn with_round(self, detail: RoundDetail) -> Self {
        self.insert_round(detail);
        self
    }

    pub fn insert_round(&self, detail: RoundDetail) {
        self.backend.lock().unwrap().rounds.insert(detail.id, detail);
    }

    /// The server's current view of a round.
    pub fn server_round(&self, round: RoundId) -> Option<RoundDetail> {
        self.backend.lock().unwrap().rounds.get(&round).cloned()
    }

    /// Supervisor verification. Returns the updated round as a push would carry it.
    pub fn verify_round(&self, round: RoundId) -> Option<RoundDetail> {
        let mut backend = self.backend.lock().unwrap();
        let detail = backend.rounds.get_mut(&round)?;
        detail.status = RoundStatus::Verified;
        Some(detail.clone())
    }

    /// Record a confirmation made from another device.
    pub fn confirm_remotely(&self, round: RoundId, submission: &CheckpointSubmission) -> Timestamp {
        let mut backend = self.backend.lock().unwrap();
        let timestamp = backend.tick();
        if let Some(detail) = backend.rounds.get_mut(&round) {
            detail.logs.push(ServerLog {
                checkpoint: submission.checkpoint,
                method: submission.method,
                timestamp,
            });
        }
        timestamp
    }

    pub fn fail_next_start(&self, error: ApiError) {
        self.backend.lock().unwrap().start_failures.push_back(error);
    }

    pub fn fail_next_end(&self, error: ApiError) {
        self.backend.lock().unwrap().end_failures.push_back(error);
    }

    pub fn fail_next_fetch(&self, error: ApiError) {
        self.backend.lock().unwrap().fetch_failures.push_back(error);
    }

    /// Fail the next `times` submissions with `error`.
    pub fn fail_submissions(&self, error: ApiError, times: usize) {
        let mut backend = self.backend.lock().unwrap();
        for _ in 0..times {
            backend.submit_failures.push_back(error.clone());
        }
    }

    /// Park submissions before they reach the backend until released.
    pub fn hold_submissions(&self) {
        self.held.send_replace(true);
    }

    pub fn release_submissions(&self) {
        self.held.send_replace(false);
    }

    /// Park `start_round` calls after they are recorded until released.
    pub fn hold_starts(&self) {
        self.starts_held.send_replace(true);
    }

    pub fn release_starts(&self) {
        self.starts_held.send_replace(false);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.backend.lock().unwrap().calls.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ApiCall::Submit { .. }))
            .count()
    }

    fn record(&self, call: ApiCall) {
        self.backend.lock().unwrap().calls.push(call);
    }
}

impl Default for NullRoundApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoundApi for NullRoundApi {
    async fn start_round(&self, round: RoundId) -> Result<Envelope<RoundDetail>, ApiError> {
        self.record(ApiCall::Start(round));

        let mut held = self.starts_held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let mut backend = self.backend.lock().unwrap();
        if let Some(error) = backend.start_failures.pop_front() {
            return Err(error);
        }
        let started = backend.tick();
        let detail = backend.rounds.get_mut(&round).ok_or_else(|| not_found(round))?;
        detail.status = RoundStatus::InProgress;
        detail.start = Some(started);
        backend.envelope(round)
    }

    async fn end_round(
        &self,
        round: RoundId,
        notes: Option<&str>,
    ) -> Result<Envelope<RoundDetail>, ApiError> {
        let mut backend = self.backend.lock().unwrap();
        backend.calls.push(ApiCall::End {
            round,
            notes: notes.map(str::to_string),
        });
        if let Some(error) = backend.end_failures.pop_front() {
            return Err(error);
        }
        let ended = backend.tick();
        let detail = backend.rounds.get_mut(&round).ok_or_else(|| not_found(round))?;
        if detail.status.rank() < RoundStatus::Completed.rank() {
            detail.status = RoundStatus::Completed;
        }
        detail.end = Some(ended);
        backend.envelope(round)
    }

    async fn submit_checkpoint(
        &self,
        round: RoundId,
        submission: &CheckpointSubmission,
    ) -> Result<Timestamp, ApiError> {
        self.record(ApiCall::Submit {
            round,
            submission: submission.clone(),
        });

        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let mut backend = self.backend.lock().unwrap();
        if let Some(error) = backend.submit_failures.pop_front() {
            return Err(error);
        }
        let timestamp = backend.tick();
        let detail = backend.rounds.get_mut(&round).ok_or_else(|| not_found(round))?;
        if detail.logs.iter().any(|l| l.checkpoint == submission.checkpoint) {
            return Err(ApiError::Rejected {
                status: 409,
                message: "checkpoint already logged".into(),
            });
        }
        detail.logs.push(ServerLog {
            checkpoint: submission.checkpoint,
            method: submission.method,
            timestamp,
        });
        Ok(timestamp)
    }

    async fn fetch_round(&self, round: RoundId) -> Result<Envelope<RoundDetail>, ApiError> {
        let mut backend = self.backend.lock().unwrap();
        backend.calls.push(ApiCall::Fetch(round));
        if let Some(error) = backend.fetch_failures.pop_front() {
            return Err(error);
        }
        backend.envelope(round)
    }
}
