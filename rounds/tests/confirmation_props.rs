use std::sync::Arc;

use patrol_nullables::{checkpoint, round_detail, NullClock, NullRoundApi};
use patrol_rounds::{ApplyEffect, MachineConfig, RoundMachine};
use patrol_types::{CheckpointId, ProofMethod, RoundId, RoundStatus, Timestamp};
use patrol_verification::ProofVerifier;
use proptest::prelude::*;

fn machine_with_round() -> RoundMachine {
    let machine = RoundMachine::new(
        Arc::new(NullRoundApi::new()),
        ProofVerifier::default(),
        Arc::new(NullClock::default()),
        MachineConfig::default(),
    );
    let mut detail = round_detail(
        3,
        (1..=4).map(|id| checkpoint(id, 19.43, -99.13)).collect(),
    );
    detail.status = RoundStatus::InProgress;
    machine.apply_server_round(detail);
    machine
}

proptest! {
    /// Any interleaving of confirmations leaves at most one confirmed log per
    /// checkpoint, carrying the first server timestamp seen.
    #[test]
    fn confirmations_are_idempotent(
        pushes in prop::collection::vec((1u64..=4, 1u64..1_000_000), 1..40)
    ) {
        let machine = machine_with_round();
        let mut first_seen = std::collections::HashMap::new();

        for (cp, at) in pushes {
            let effect = machine.apply_confirmation(
                RoundId::new(3),
                CheckpointId::new(cp),
                ProofMethod::Nfc,
                Timestamp::new(at),
            );
            if first_seen.contains_key(&cp) {
                prop_assert_eq!(effect, ApplyEffect::Duplicate);
            } else {
                prop_assert_eq!(effect, ApplyEffect::Applied);
                first_seen.insert(cp, at);
            }
        }

        let round = machine.round().unwrap();
        for cp in 1..=4u64 {
            let id = CheckpointId::new(cp);
            let confirmed = round
                .logs
                .iter()
                .filter(|l| l.checkpoint == id && l.is_confirmed())
                .count();
            prop_assert!(confirmed <= 1);
            if let Some(at) = first_seen.get(&cp) {
                prop_assert_eq!(
                    round.confirmed_log(id).and_then(|l| l.server_at),
                    Some(Timestamp::new(*at))
                );
            }
        }
        prop_assert_eq!(round.progress(), (first_seen.len(), 4));
    }
}
