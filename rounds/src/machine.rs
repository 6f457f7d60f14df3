//! The round state machine.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`: every operation reads and mutates under the lock, drops it,
//! performs I/O, then re-acquires it to apply the result. The check that a
//! checkpoint has no pending submission and the insertion of the pending log
//! happen under one acquisition, which is what makes `AlreadyPending` sound
//! when several tasks log concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use patrol_types::{
    Checkpoint, CheckpointId, CheckpointLog, Clock, ProofMethod, RejectionReason, Round, RoundId,
    RoundStatus, Timestamp,
};
use patrol_verification::{Evidence, ProofVerifier, VerificationOutcome};

use crate::api::{CheckpointSubmission, RoundApi, RoundDetail};
use crate::{ApiError, RoundError, RoundEvent};

/// Failed submissions tolerated before a pending log is abandoned.
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineConfig {
    /// Number of failed submission attempts after which a pending log becomes
    /// `Rejected(RetryBudgetExhausted)`.
    pub retry_budget: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

/// A checkpoint acknowledged by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    pub round: RoundId,
    pub checkpoint: CheckpointId,
    pub server_at: Timestamp,
    /// `(confirmed, total)`, or `None` if the round stopped being active
    /// while the submission was in flight.
    pub progress: Option<(usize, usize)>,
}

/// What applying a piece of server truth did to local state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyEffect {
    Applied,
    /// Local state already reflected it.
    Duplicate,
    /// Not applicable to the active round.
    Ignored,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub confirmed: Vec<CheckpointId>,
    pub rejected: Vec<CheckpointId>,
    pub still_pending: Vec<CheckpointId>,
}

#[derive(Default)]
struct MachineState {
    round: Option<Round>,
    checkpoints: HashMap<CheckpointId, Checkpoint>,
    /// Checkpoints with a submission currently awaiting the server.
    in_flight: HashSet<CheckpointId>,
    /// Bumped by `discard`; a round fetched before the bump is stale.
    generation: u64,
}

pub struct RoundMachine {
    api: Arc<dyn RoundApi>,
    verifier: ProofVerifier,
    clock: Arc<dyn Clock>,
    config: MachineConfig,
    state: Mutex<MachineState>,
    events: broadcast::Sender<RoundEvent>,
}

impl RoundMachine {
    pub fn new(
        api: Arc<dyn RoundApi>,
        verifier: ProofVerifier,
        clock: Arc<dyn Clock>,
        config: MachineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            api,
            verifier,
            clock,
            config,
            state: Mutex::new(MachineState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> MachineConfig {
        self.config
    }

    pub fn round(&self) -> Option<Round> {
        self.lock().round.clone()
    }

    pub fn active_round_id(&self) -> Option<RoundId> {
        self.lock().round.as_ref().map(|r| r.id)
    }

    pub fn status(&self) -> Option<RoundStatus> {
        self.lock().round.as_ref().map(|r| r.status)
    }

    pub fn progress(&self) -> Option<(usize, usize)> {
        self.lock().round.as_ref().map(|r| r.progress())
    }

    pub fn checkpoint(&self, id: CheckpointId) -> Option<Checkpoint> {
        self.lock().checkpoints.get(&id).cloned()
    }

    /// The current log for a checkpoint of the active round.
    pub fn log(&self, id: CheckpointId) -> Option<CheckpointLog> {
        self.lock()
            .round
            .as_ref()
            .and_then(|r| r.logs.iter().find(|l| l.checkpoint == id).cloned())
    }

    /// Start a round on the server and make it the active round.
    pub async fn start(&self, id: RoundId) -> Result<Round, RoundError> {
        let generation = {
            let state = self.lock();
            if let Some(active) = &state.round {
                if active.status == RoundStatus::InProgress {
                    return Err(RoundError::InvalidState {
                        op: "start",
                        status: active.status,
                    });
                }
            }
            state.generation
        };

        let envelope = self.api.start_round(id).await?;
        let mut detail = envelope.data;
        if detail.status.rank() < RoundStatus::InProgress.rank() {
            detail.status = RoundStatus::InProgress;
        }
        if detail.start.is_none() {
            detail.start = Some(envelope.timestamp);
        }

        let round = self.install_current("start", generation, detail)?;
        info!(round = %round.id, checkpoints = round.checkpoints.len(), "round started");
        Ok(round)
    }

    /// Adopt a round that is already in progress on the server (app relaunch,
    /// second device). The active round, if any, must be the same round or
    /// not in progress.
    pub async fn resume(&self, id: RoundId) -> Result<Round, RoundError> {
        let generation = {
            let state = self.lock();
            if let Some(active) = &state.round {
                if active.status == RoundStatus::InProgress && active.id != id {
                    return Err(RoundError::RoundMismatch {
                        active: active.id,
                        requested: id,
                    });
                }
            }
            state.generation
        };

        let detail = self.api.fetch_round(id).await?.data;
        if detail.status != RoundStatus::InProgress {
            return Err(RoundError::InvalidState {
                op: "resume",
                status: detail.status,
            });
        }
        if self.active_round_id() == Some(id) {
            self.apply_server_round(detail);
            return self.round().ok_or(RoundError::NoActiveRound);
        }

        let round = self.install_current("resume", generation, detail)?;
        info!(round = %round.id, "round resumed");
        Ok(round)
    }

    /// Verify evidence locally, then submit it.
    ///
    /// Rejected evidence never reaches the network. Accepted evidence becomes
    /// a pending log before the request is sent; a network failure leaves it
    /// pending for [`RoundMachine::retry_pending`].
    pub async fn log_checkpoint(
        &self,
        checkpoint: CheckpointId,
        evidence: Evidence,
    ) -> Result<Confirmation, RoundError> {
        let (round_id, submission) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let round = state.round.as_mut().ok_or(RoundError::NoActiveRound)?;
            if round.status != RoundStatus::InProgress {
                return Err(RoundError::InvalidState {
                    op: "log checkpoint",
                    status: round.status,
                });
            }
            if !round.contains(checkpoint) {
                return Err(RoundError::NotInRound(checkpoint));
            }
            if round.confirmed_log(checkpoint).is_some() {
                return Err(RoundError::AlreadyConfirmed(checkpoint));
            }
            if round.pending_log(checkpoint).is_some() || state.in_flight.contains(&checkpoint) {
                return Err(RoundError::AlreadyPending(checkpoint));
            }
            let details = state
                .checkpoints
                .get(&checkpoint)
                .ok_or(RoundError::UnknownCheckpoint(checkpoint))?;

            if let VerificationOutcome::Rejected(reason) =
                self.verifier.verify(details, round.id, &evidence)
            {
                warn!(
                    round = %round.id,
                    checkpoint = %checkpoint,
                    method = %evidence.method(),
                    reason = %reason,
                    "checkpoint evidence rejected"
                );
                return Err(RoundError::Verification(reason));
            }

            // A new attempt replaces an earlier rejected log.
            round.logs.retain(|l| l.checkpoint != checkpoint);
            round.logs.push(CheckpointLog::pending(
                checkpoint,
                evidence.method(),
                evidence.to_proof(),
                self.clock.now(),
            ));
            state.in_flight.insert(checkpoint);
            (round.id, CheckpointSubmission::from_evidence(checkpoint, &evidence))
        };

        self.publish(RoundEvent::CheckpointPending {
            round: round_id,
            checkpoint,
        });
        debug!(
            round = %round_id,
            checkpoint = %checkpoint,
            method = %submission.method,
            "submitting"
        );

        let result = self.api.submit_checkpoint(round_id, &submission).await;
        self.finish_submission(round_id, &submission, result)
    }

    /// End the active round. Unconfirmed checkpoints do not block ending.
    pub async fn end(&self, id: RoundId, notes: Option<&str>) -> Result<Round, RoundError> {
        {
            let state = self.lock();
            let active = state.round.as_ref().ok_or(RoundError::NoActiveRound)?;
            if active.id != id {
                return Err(RoundError::RoundMismatch {
                    active: active.id,
                    requested: id,
                });
            }
            if active.status != RoundStatus::InProgress {
                return Err(RoundError::InvalidState {
                    op: "end",
                    status: active.status,
                });
            }
        }

        let envelope = self.api.end_round(id, notes).await?;
        let mut detail = envelope.data;
        if detail.status.rank() < RoundStatus::Completed.rank() {
            detail.status = RoundStatus::Completed;
        }
        if detail.end.is_none() {
            detail.end = Some(envelope.timestamp);
        }

        let round = match self.apply_server_round(detail.clone()) {
            ApplyEffect::Ignored => detail.to_round(),
            _ => self.round().unwrap_or_else(|| detail.to_round()),
        };
        let (confirmed, total) = round.progress();
        info!(round = %id, confirmed, total, "round ended");
        Ok(round)
    }

    /// Fold a server confirmation into local state. Idempotent: an already
    /// confirmed log keeps its original server timestamp.
    pub fn apply_confirmation(
        &self,
        round_id: RoundId,
        checkpoint: CheckpointId,
        method: ProofMethod,
        server_at: Timestamp,
    ) -> ApplyEffect {
        let progress = {
            let mut state = self.lock();
            let Some(round) = state.round.as_mut().filter(|r| r.id == round_id) else {
                return ApplyEffect::Ignored;
            };
            if !round.contains(checkpoint) {
                return ApplyEffect::Ignored;
            }
            if round.confirmed_log(checkpoint).is_some() {
                return ApplyEffect::Duplicate;
            }
            match round.logs.iter_mut().find(|l| l.checkpoint == checkpoint) {
                Some(log) => log.confirm(server_at),
                None => round
                    .logs
                    .push(CheckpointLog::from_server(checkpoint, method, server_at)),
            }
            round.progress()
        };

        info!(
            round = %round_id,
            checkpoint = %checkpoint,
            server_at = %server_at,
            confirmed = progress.0,
            total = progress.1,
            "checkpoint confirmed"
        );
        self.publish(RoundEvent::CheckpointConfirmed {
            round: round_id,
            checkpoint,
            server_at,
            progress,
        });
        ApplyEffect::Applied
    }

    /// Fold a server rejection into local state. Only a pending log is
    /// affected; a confirmed log is server truth already.
    pub fn apply_rejection(
        &self,
        round_id: RoundId,
        checkpoint: CheckpointId,
        reason: RejectionReason,
    ) -> ApplyEffect {
        {
            let mut state = self.lock();
            let Some(round) = state.round.as_mut().filter(|r| r.id == round_id) else {
                return ApplyEffect::Ignored;
            };
            match round.logs.iter_mut().find(|l| l.checkpoint == checkpoint) {
                Some(log) if log.is_pending() => log.reject(reason.clone()),
                Some(log) if log.is_rejected() => return ApplyEffect::Duplicate,
                _ => return ApplyEffect::Ignored,
            }
        }

        warn!(round = %round_id, checkpoint = %checkpoint, reason = ?reason, "checkpoint rejected");
        self.publish(RoundEvent::CheckpointRejected {
            round: round_id,
            checkpoint,
            reason,
        });
        ApplyEffect::Applied
    }

    /// Overwrite local state with a server snapshot of a round.
    ///
    /// Status never regresses. Server logs confirm local ones; local pending
    /// logs the server does not mention are kept. A snapshot of a different
    /// round replaces the active one when the active round is finished or the
    /// reported round is in progress.
    pub fn apply_server_round(&self, detail: RoundDetail) -> ApplyEffect {
        let mut events = Vec::new();
        let effect = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.round.as_mut() {
                Some(local) if local.id == detail.id => {
                    let changed =
                        merge_detail(local, &mut state.checkpoints, &detail, &mut events);
                    if changed {
                        ApplyEffect::Applied
                    } else {
                        ApplyEffect::Duplicate
                    }
                }
                Some(local)
                    if local.status == RoundStatus::InProgress
                        && detail.status != RoundStatus::InProgress =>
                {
                    debug!(
                        active = %local.id,
                        reported = %detail.id,
                        "ignoring snapshot of another round"
                    );
                    ApplyEffect::Ignored
                }
                None if detail.status != RoundStatus::InProgress => ApplyEffect::Ignored,
                _ => {
                    if let Some(previous) = &state.round {
                        info!(
                            previous = %previous.id,
                            round = %detail.id,
                            "round superseded by server"
                        );
                    }
                    let round = install_into(state, &detail);
                    events.push(RoundEvent::Installed { round });
                    ApplyEffect::Applied
                }
            }
        };
        for event in events {
            self.publish(event);
        }
        effect
    }

    /// Re-fetch the active round and apply it as server truth.
    pub async fn refresh(&self) -> Result<ApplyEffect, RoundError> {
        let id = self.active_round_id().ok_or(RoundError::NoActiveRound)?;
        let envelope = self.api.fetch_round(id).await?;
        Ok(self.apply_server_round(envelope.data))
    }

    /// Resubmit every pending log that is not already awaiting the server.
    pub async fn retry_pending(&self) -> RetryReport {
        let targets: Vec<(RoundId, CheckpointSubmission)> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(round) = state.round.as_ref() else {
                return RetryReport::default();
            };
            let targets: Vec<_> = round
                .logs
                .iter()
                .filter(|l| l.is_pending() && !state.in_flight.contains(&l.checkpoint))
                .map(|l| {
                    (
                        round.id,
                        CheckpointSubmission::from_proof(l.checkpoint, l.method, &l.proof),
                    )
                })
                .collect();
            for (_, submission) in &targets {
                state.in_flight.insert(submission.checkpoint);
            }
            targets
        };

        let mut report = RetryReport::default();
        for (round_id, submission) in targets {
            let checkpoint = submission.checkpoint;
            let result = self.api.submit_checkpoint(round_id, &submission).await;
            match self.finish_submission(round_id, &submission, result) {
                Ok(_) => report.confirmed.push(checkpoint),
                Err(RoundError::ServerRejected { .. }) => report.rejected.push(checkpoint),
                Err(_) if self.log(checkpoint).is_some_and(|l| l.is_rejected()) => {
                    report.rejected.push(checkpoint)
                }
                Err(_) => report.still_pending.push(checkpoint),
            }
        }
        if !report.confirmed.is_empty() || !report.rejected.is_empty() {
            info!(
                confirmed = report.confirmed.len(),
                rejected = report.rejected.len(),
                still_pending = report.still_pending.len(),
                "pending checkpoints retried"
            );
        }
        report
    }

    /// Drop the active round without contacting the server.
    pub fn discard(&self) -> Option<Round> {
        let round = {
            let mut state = self.lock();
            state.checkpoints.clear();
            state.in_flight.clear();
            state.generation += 1;
            state.round.take()
        };
        if let Some(round) = &round {
            info!(round = %round.id, "round discarded");
            self.publish(RoundEvent::Discarded { round: round.id });
        }
        round
    }

    /// Install a round fetched by `op`, unless the machine was discarded or
    /// another round went in progress since the fetch began.
    fn install_current(
        &self,
        op: &'static str,
        generation: u64,
        detail: RoundDetail,
    ) -> Result<Round, RoundError> {
        let round = {
            let mut state = self.lock();
            if state.generation != generation {
                warn!(round = %detail.id, op, "dropping round fetched before discard");
                return Err(RoundError::Discarded(detail.id));
            }
            if let Some(active) = state
                .round
                .as_ref()
                .filter(|r| r.status == RoundStatus::InProgress && r.id != detail.id)
            {
                return Err(RoundError::InvalidState {
                    op,
                    status: active.status,
                });
            }
            install_into(&mut state, &detail)
        };
        self.publish(RoundEvent::Installed {
            round: round.clone(),
        });
        Ok(round)
    }

    fn finish_submission(
        &self,
        round_id: RoundId,
        submission: &CheckpointSubmission,
        result: Result<Timestamp, ApiError>,
    ) -> Result<Confirmation, RoundError> {
        let checkpoint = submission.checkpoint;
        self.lock().in_flight.remove(&checkpoint);

        if let Err(e) = &result {
            // A push may have confirmed the log while the request was out.
            if let Some(confirmation) = self.local_confirmation(round_id, checkpoint) {
                debug!(
                    round = %round_id,
                    checkpoint = %checkpoint,
                    error = %e,
                    "submission failed after the log was already confirmed"
                );
                return Ok(confirmation);
            }
        }

        match result {
            Ok(server_at) => {
                self.apply_confirmation(round_id, checkpoint, submission.method, server_at);
                Ok(self
                    .local_confirmation(round_id, checkpoint)
                    .unwrap_or(Confirmation {
                        round: round_id,
                        checkpoint,
                        server_at,
                        progress: None,
                    }))
            }
            Err(ApiError::Rejected { message, .. }) => {
                self.apply_rejection(
                    round_id,
                    checkpoint,
                    RejectionReason::ServerRejected {
                        message: message.clone(),
                    },
                );
                Err(RoundError::ServerRejected {
                    checkpoint,
                    message,
                })
            }
            Err(e) => {
                self.record_failed_attempt(round_id, checkpoint, &e);
                Err(RoundError::Api(e))
            }
        }
    }

    /// The confirmed log for `checkpoint`, if `round_id` is active and holds one.
    fn local_confirmation(
        &self,
        round_id: RoundId,
        checkpoint: CheckpointId,
    ) -> Option<Confirmation> {
        let state = self.lock();
        let round = state.round.as_ref().filter(|r| r.id == round_id)?;
        let server_at = round.confirmed_log(checkpoint)?.server_at?;
        Some(Confirmation {
            round: round_id,
            checkpoint,
            server_at,
            progress: Some(round.progress()),
        })
    }

    fn record_failed_attempt(&self, round_id: RoundId, checkpoint: CheckpointId, error: &ApiError) {
        let exhausted = {
            let mut state = self.lock();
            let Some(log) = state
                .round
                .as_mut()
                .filter(|r| r.id == round_id)
                .and_then(|r| r.pending_log_mut(checkpoint))
            else {
                return;
            };
            log.attempts += 1;
            warn!(
                round = %round_id,
                checkpoint = %checkpoint,
                attempts = log.attempts,
                error = %error,
                "checkpoint submission failed, log stays pending"
            );
            log.attempts >= self.config.retry_budget
        };
        if exhausted {
            self.apply_rejection(
                round_id,
                checkpoint,
                RejectionReason::RetryBudgetExhausted {
                    attempts: self.config.retry_budget,
                },
            );
        }
    }

    fn publish(&self, event: RoundEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn install_into(state: &mut MachineState, detail: &RoundDetail) -> Round {
    let round = detail.to_round();
    state.checkpoints = detail
        .checkpoints
        .iter()
        .map(|c| (c.id, c.clone()))
        .collect();
    state.in_flight.clear();
    state.round = Some(round.clone());
    round
}

/// Merge a snapshot of the same round into `local`. Returns whether anything
/// changed.
fn merge_detail(
    local: &mut Round,
    checkpoints: &mut HashMap<CheckpointId, Checkpoint>,
    detail: &RoundDetail,
    events: &mut Vec<RoundEvent>,
) -> bool {
    let mut changed = false;

    if detail.status != local.status {
        if local.status.accepts_server(detail.status) {
            info!(
                round = %local.id,
                from = %local.status,
                to = %detail.status,
                "round status updated by server"
            );
            local.status = detail.status;
            events.push(RoundEvent::StatusChanged {
                round: local.id,
                status: detail.status,
            });
            changed = true;
        } else {
            debug!(
                round = %local.id,
                local = %local.status,
                reported = %detail.status,
                "stale status ignored"
            );
        }
    }
    if detail.start.is_some() && detail.start != local.start {
        local.start = detail.start;
        changed = true;
    }
    if detail.end.is_some() && detail.end != local.end {
        local.end = detail.end;
        changed = true;
    }
    if !detail.checkpoints.is_empty() {
        let ids: Vec<CheckpointId> = detail.checkpoints.iter().map(|c| c.id).collect();
        if ids != local.checkpoints {
            local.checkpoints = ids;
            changed = true;
        }
        for cp in &detail.checkpoints {
            checkpoints.insert(cp.id, cp.clone());
        }
    }

    for server_log in &detail.logs {
        if local.confirmed_log(server_log.checkpoint).is_some() {
            continue;
        }
        match local
            .logs
            .iter_mut()
            .find(|l| l.checkpoint == server_log.checkpoint)
        {
            Some(log) => log.confirm(server_log.timestamp),
            None => local.logs.push(CheckpointLog::from_server(
                server_log.checkpoint,
                server_log.method,
                server_log.timestamp,
            )),
        }
        changed = true;
        events.push(RoundEvent::CheckpointConfirmed {
            round: local.id,
            checkpoint: server_log.checkpoint,
            server_at: server_log.timestamp,
            progress: local.progress(),
        });
    }
    changed
}
