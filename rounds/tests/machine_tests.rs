//! Round lifecycle against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use patrol_nullables::{checkpoint, round_detail, NullClock, NullRoundApi};
use patrol_rounds::{
    ApiError, ApplyEffect, CheckpointSubmission, MachineConfig, RoundError, RoundEvent,
    RoundMachine,
};
use patrol_types::{
    CheckpointId, ErrorKind, LogStatus, ProofMethod, ProofPayload, RejectionReason, RoundId,
    RoundStatus, Timestamp,
};
use patrol_verification::{Evidence, ProofVerifier, RejectReason};

const ROUND: RoundId = RoundId::new(5);
const GATE: CheckpointId = CheckpointId::new(1);
const DOCK: CheckpointId = CheckpointId::new(2);

fn backend() -> Arc<NullRoundApi> {
    Arc::new(NullRoundApi::new().with_round(round_detail(
        5,
        vec![
            checkpoint(1, 19.4326, -99.1332),
            checkpoint(2, 19.4340, -99.1340),
        ],
    )))
}

fn machine_with(api: &Arc<NullRoundApi>, config: MachineConfig) -> Arc<RoundMachine> {
    Arc::new(RoundMachine::new(
        api.clone(),
        ProofVerifier::default(),
        Arc::new(NullClock::new(1_000)),
        config,
    ))
}

fn machine(api: &Arc<NullRoundApi>) -> Arc<RoundMachine> {
    machine_with(api, MachineConfig::default())
}

fn qr(code: &str) -> Evidence {
    Evidence::Qr { code: code.into() }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_lifecycle_start_log_end() {
    let api = backend();
    let machine = machine(&api);

    let round = machine.start(ROUND).await.unwrap();
    assert_eq!(round.status, RoundStatus::InProgress);
    assert!(round.start.is_some());
    assert_eq!(round.checkpoints, vec![GATE, DOCK]);

    let err = machine
        .log_checkpoint(CheckpointId::new(99), qr("CP-99"))
        .await
        .unwrap_err();
    assert!(matches!(err, RoundError::NotInRound(_)));
    assert_eq!(api.submit_count(), 0);

    let confirmation = machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap();
    assert_eq!(confirmation.progress, Some((1, 2)));

    // Ending with an unconfirmed checkpoint is allowed.
    let ended = machine.end(ROUND, Some("dock locked")).await.unwrap();
    assert_eq!(ended.status, RoundStatus::Completed);
    assert!(ended.end.is_some());
    assert_eq!(ended.progress(), (1, 2));

    let err = machine.log_checkpoint(DOCK, qr("CP-2")).await.unwrap_err();
    assert!(matches!(
        err,
        RoundError::InvalidState {
            status: RoundStatus::Completed,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn start_while_in_progress_is_invalid() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();

    let err = machine.start(ROUND).await.unwrap_err();
    assert!(matches!(err, RoundError::InvalidState { .. }));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn failed_start_leaves_state_unchanged() {
    let api = backend();
    let machine = machine(&api);
    api.fail_next_start(ApiError::NetworkUnavailable("offline".into()));

    let err = machine.start(ROUND).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkUnavailable);
    assert!(machine.round().is_none());
}

#[tokio::test]
async fn terminal_round_is_superseded_by_next_start() {
    let api = backend();
    api.insert_round(round_detail(6, vec![checkpoint(3, 19.0, -99.0)]));
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    machine.end(ROUND, None).await.unwrap();

    let next = machine.start(RoundId::new(6)).await.unwrap();
    assert_eq!(next.id, RoundId::new(6));
    assert_eq!(machine.active_round_id(), Some(RoundId::new(6)));
}

#[tokio::test]
async fn end_requires_the_active_round() {
    let api = backend();
    let machine = machine(&api);
    assert!(matches!(
        machine.end(ROUND, None).await,
        Err(RoundError::NoActiveRound)
    ));

    machine.start(ROUND).await.unwrap();
    let err = machine.end(RoundId::new(8), None).await.unwrap_err();
    assert!(matches!(err, RoundError::RoundMismatch { .. }));
}

#[tokio::test]
async fn discard_drops_the_round_and_notifies() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    let mut events = machine.subscribe();

    let dropped = machine.discard().unwrap();
    assert_eq!(dropped.id, ROUND);
    assert!(machine.round().is_none());
    assert_eq!(
        events.recv().await.unwrap(),
        RoundEvent::Discarded { round: ROUND }
    );
}

// ---------------------------------------------------------------------------
// Checkpoint logging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_evidence_never_reaches_the_server() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();

    let err = machine.log_checkpoint(GATE, qr("CP-9")).await.unwrap_err();
    assert!(matches!(
        err,
        RoundError::Verification(RejectReason::PayloadMismatch)
    ));
    assert_eq!(api.submit_count(), 0);
    assert!(machine.log(GATE).is_none());

    let far = Evidence::Gps {
        point: patrol_types::GeoPoint::new(19.4344, -99.1332),
        accuracy_m: 5.0,
    };
    let err = machine.log_checkpoint(GATE, far).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert_eq!(api.submit_count(), 0);
}

#[tokio::test]
async fn second_log_while_in_flight_is_already_pending() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    api.hold_submissions();

    let first = {
        let machine = machine.clone();
        tokio::spawn(async move { machine.log_checkpoint(GATE, qr("CP-1")).await })
    };
    let watched = api.clone();
    wait_until(|| watched.submit_count() == 1).await;
    assert_eq!(machine.log(GATE).unwrap().status, LogStatus::Pending);

    let err = machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap_err();
    assert!(matches!(err, RoundError::AlreadyPending(_)));
    assert_eq!(err.kind(), ErrorKind::AlreadyPending);

    // Distinct checkpoints may be in flight together.
    let second = {
        let machine = machine.clone();
        tokio::spawn(async move { machine.log_checkpoint(DOCK, qr("CP-2")).await })
    };
    let watched = api.clone();
    wait_until(|| watched.submit_count() == 2).await;

    api.release_submissions();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(machine.progress(), Some((2, 2)));
    assert_eq!(api.submit_count(), 2);
}

#[tokio::test]
async fn confirmed_checkpoint_cannot_be_logged_again() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap();

    let err = machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap_err();
    assert!(matches!(err, RoundError::AlreadyConfirmed(_)));
    assert_eq!(api.submit_count(), 1);
}

#[tokio::test]
async fn network_failure_keeps_log_pending_until_retry() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    api.fail_submissions(ApiError::NetworkUnavailable("no route".into()), 1);

    let err = machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap_err();
    assert!(err.kind().is_transient());
    let log = machine.log(GATE).unwrap();
    assert_eq!(log.status, LogStatus::Pending);
    assert_eq!(log.attempts, 1);
    assert_eq!(machine.progress(), Some((0, 2)));

    let report = machine.retry_pending().await;
    assert_eq!(report.confirmed, vec![GATE]);
    assert!(report.still_pending.is_empty());
    assert!(machine.log(GATE).unwrap().is_confirmed());
}

#[tokio::test]
async fn retry_resubmits_the_original_proof() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    api.fail_submissions(ApiError::Timeout, 1);
    let _ = machine.log_checkpoint(GATE, qr("CP-1")).await;

    machine.retry_pending().await;
    let submissions: Vec<CheckpointSubmission> = api
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            patrol_nullables::ApiCall::Submit { submission, .. } => Some(submission),
            _ => None,
        })
        .collect();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0], submissions[1]);
    assert_eq!(submissions[1].code.as_deref(), Some("CP-1"));
}

#[tokio::test]
async fn server_rejection_overwrites_pending_log() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    api.fail_submissions(
        ApiError::Rejected {
            status: 409,
            message: "outside round window".into(),
        },
        1,
    );

    let err = machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap_err();
    assert!(matches!(err, RoundError::ServerRejected { .. }));
    assert_eq!(
        machine.log(GATE).unwrap().status,
        LogStatus::Rejected(RejectionReason::ServerRejected {
            message: "outside round window".into()
        })
    );

    // A fresh attempt replaces the rejected log.
    machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap();
    let round = machine.round().unwrap();
    assert_eq!(round.logs.iter().filter(|l| l.checkpoint == GATE).count(), 1);
    assert!(round.confirmed_log(GATE).is_some());
}

#[tokio::test]
async fn retry_budget_exhaustion_rejects_the_log() {
    let api = backend();
    let machine = machine_with(&api, MachineConfig { retry_budget: 3 });
    machine.start(ROUND).await.unwrap();
    api.fail_submissions(ApiError::Timeout, 3);
    let mut events = machine.subscribe();

    let _ = machine.log_checkpoint(GATE, qr("CP-1")).await;
    let report = machine.retry_pending().await;
    assert_eq!(report.still_pending, vec![GATE]);
    assert_eq!(machine.log(GATE).unwrap().attempts, 2);

    let report = machine.retry_pending().await;
    assert_eq!(report.rejected, vec![GATE]);
    assert_eq!(
        machine.log(GATE).unwrap().status,
        LogStatus::Rejected(RejectionReason::RetryBudgetExhausted { attempts: 3 })
    );

    let mut saw_rejection = false;
    while let Ok(event) = events.try_recv() {
        if let RoundEvent::CheckpointRejected { checkpoint, .. } = event {
            assert_eq!(checkpoint, GATE);
            saw_rejection = true;
        }
    }
    assert!(saw_rejection);

    // Nothing left to retry.
    let report = machine.retry_pending().await;
    assert_eq!(report, Default::default());
}

#[tokio::test]
async fn log_events_are_published_in_order() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    let mut events = machine.subscribe();

    machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        RoundEvent::CheckpointPending {
            round: ROUND,
            checkpoint: GATE
        }
    );
    match events.recv().await.unwrap() {
        RoundEvent::CheckpointConfirmed {
            checkpoint,
            progress,
            ..
        } => {
            assert_eq!(checkpoint, GATE);
            assert_eq!(progress, (1, 2));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Server truth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirmation_is_idempotent() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    let confirmation = machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap();

    let effect = machine.apply_confirmation(ROUND, GATE, ProofMethod::Qr, Timestamp::new(42));
    assert_eq!(effect, ApplyEffect::Duplicate);
    let log = machine.log(GATE).unwrap();
    assert_eq!(log.server_at, Some(confirmation.server_at));
    assert_eq!(machine.progress(), Some((1, 2)));
}

#[tokio::test]
async fn push_before_http_ack_confirms_once() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    api.hold_submissions();

    let submit = {
        let machine = machine.clone();
        tokio::spawn(async move { machine.log_checkpoint(GATE, qr("CP-1")).await })
    };
    let watched = api.clone();
    wait_until(|| watched.submit_count() == 1).await;

    let pushed_at = Timestamp::new(1_700_000_000_500);
    assert_eq!(
        machine.apply_confirmation(ROUND, GATE, ProofMethod::Qr, pushed_at),
        ApplyEffect::Applied
    );
    api.release_submissions();

    let confirmation = submit.await.unwrap().unwrap();
    assert_eq!(confirmation.server_at, pushed_at);
    let round = machine.round().unwrap();
    assert_eq!(round.logs.len(), 1);
    assert_eq!(round.logs[0].server_at, Some(pushed_at));
}

#[tokio::test]
async fn push_confirmation_survives_failed_http_ack() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    api.hold_submissions();
    api.fail_submissions(ApiError::Timeout, 1);

    let submit = {
        let machine = machine.clone();
        tokio::spawn(async move { machine.log_checkpoint(GATE, qr("CP-1")).await })
    };
    let watched = api.clone();
    wait_until(|| watched.submit_count() == 1).await;

    let pushed_at = Timestamp::new(1_700_000_000_700);
    machine.apply_confirmation(ROUND, GATE, ProofMethod::Qr, pushed_at);
    api.release_submissions();

    let confirmation = submit.await.unwrap().unwrap();
    assert_eq!(confirmation.server_at, pushed_at);
    assert_eq!(confirmation.progress, Some((1, 2)));
    let log = machine.log(GATE).unwrap();
    assert_eq!(log.status, LogStatus::Confirmed);
    assert_eq!(log.attempts, 0);
}

#[tokio::test]
async fn confirmation_for_another_round_is_ignored() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    assert_eq!(
        machine.apply_confirmation(RoundId::new(77), GATE, ProofMethod::Qr, Timestamp::new(1)),
        ApplyEffect::Ignored
    );
    assert_eq!(machine.progress(), Some((0, 2)));
}

#[tokio::test]
async fn supervisor_verification_is_applied_and_never_regressed() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    machine.log_checkpoint(GATE, qr("CP-1")).await.unwrap();
    machine.end(ROUND, None).await.unwrap();

    let verified = api.verify_round(ROUND).unwrap();
    assert_eq!(machine.apply_server_round(verified.clone()), ApplyEffect::Applied);
    assert_eq!(machine.status(), Some(RoundStatus::Verified));

    let mut stale = verified;
    stale.status = RoundStatus::InProgress;
    assert_eq!(machine.apply_server_round(stale), ApplyEffect::Duplicate);
    assert_eq!(machine.status(), Some(RoundStatus::Verified));
    assert_eq!(machine.progress(), Some((1, 2)));
}

#[tokio::test]
async fn refresh_folds_remote_confirmations() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    let remote = CheckpointSubmission::from_evidence(DOCK, &qr("CP-2"));
    let server_at = api.confirm_remotely(ROUND, &remote);

    assert_eq!(machine.refresh().await.unwrap(), ApplyEffect::Applied);
    let log = machine.log(DOCK).unwrap();
    assert!(log.is_confirmed());
    assert_eq!(log.server_at, Some(server_at));
    assert_eq!(log.proof, ProofPayload::Remote);

    // A second refresh changes nothing.
    assert_eq!(machine.refresh().await.unwrap(), ApplyEffect::Duplicate);
}

#[tokio::test]
async fn refresh_keeps_local_pending_logs() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();
    api.fail_submissions(ApiError::Timeout, 1);
    let _ = machine.log_checkpoint(GATE, qr("CP-1")).await;

    machine.refresh().await.unwrap();
    assert_eq!(machine.log(GATE).unwrap().status, LogStatus::Pending);
}

#[tokio::test]
async fn server_round_supersedes_only_when_appropriate() {
    let api = backend();
    let machine = machine(&api);
    machine.start(ROUND).await.unwrap();

    let mut finished_elsewhere = round_detail(9, vec![checkpoint(4, 19.0, -99.0)]);
    finished_elsewhere.status = RoundStatus::Completed;
    assert_eq!(
        machine.apply_server_round(finished_elsewhere),
        ApplyEffect::Ignored
    );
    assert_eq!(machine.active_round_id(), Some(ROUND));

    let mut reassigned = round_detail(9, vec![checkpoint(4, 19.0, -99.0)]);
    reassigned.status = RoundStatus::InProgress;
    assert_eq!(machine.apply_server_round(reassigned), ApplyEffect::Applied);
    assert_eq!(machine.active_round_id(), Some(RoundId::new(9)));
    assert!(machine.checkpoint(CheckpointId::new(4)).is_some());
    assert!(machine.checkpoint(GATE).is_none());
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_adopts_round_started_elsewhere() {
    let api = backend();
    let first_device = machine(&api);
    first_device.start(ROUND).await.unwrap();
    first_device.log_checkpoint(GATE, qr("CP-1")).await.unwrap();

    let relaunched = machine(&api);
    let round = relaunched.resume(ROUND).await.unwrap();
    assert_eq!(round.status, RoundStatus::InProgress);
    assert!(relaunched.log(GATE).unwrap().is_confirmed());
    assert!(relaunched.checkpoint(DOCK).is_some());

    relaunched.log_checkpoint(DOCK, qr("CP-2")).await.unwrap();
    assert_eq!(relaunched.progress(), Some((2, 2)));

    // Resuming the active round again only merges.
    relaunched.resume(ROUND).await.unwrap();
    assert_eq!(relaunched.progress(), Some((2, 2)));
}

#[tokio::test]
async fn resume_requires_an_in_progress_round() {
    let api = backend();
    let machine = machine(&api);

    let err = machine.resume(ROUND).await.unwrap_err();
    assert!(matches!(
        err,
        RoundError::InvalidState { op: "resume", status: RoundStatus::NotStarted }
    ));
    assert!(machine.round().is_none());

    let other = RoundId::new(9);
    let mut detail = round_detail(9, vec![checkpoint(4, 19.0, -99.0)]);
    detail.status = RoundStatus::InProgress;
    api.insert_round(detail);
    machine.start(ROUND).await.unwrap();
    let err = machine.resume(other).await.unwrap_err();
    assert!(matches!(err, RoundError::RoundMismatch { .. }));
    assert_eq!(machine.active_round_id(), Some(ROUND));
}

// ---------------------------------------------------------------------------
// Discard races
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_answered_after_discard_is_dropped() {
    let api = backend();
    let machine = machine(&api);
    api.hold_starts();

    let start = {
        let machine = machine.clone();
        tokio::spawn(async move { machine.start(ROUND).await })
    };
    let watched = api.clone();
    wait_until(|| !watched.calls().is_empty()).await;

    machine.discard();
    api.release_starts();

    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, RoundError::Discarded(id) if id == ROUND));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(machine.round().is_none());

    // A fresh start after the discard is unaffected.
    assert_eq!(machine.start(ROUND).await.unwrap().status, RoundStatus::InProgress);
}
