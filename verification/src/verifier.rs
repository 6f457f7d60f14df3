//! Pure verification policy for the three proof methods.

use serde::Deserialize;
use std::fmt;

use patrol_nfc::TagRead;
use patrol_types::{Checkpoint, ErrorKind, GeoPoint, ProofMethod, ProofPayload, RoundId};

use crate::geo::haversine_m;

/// Evidence acquired for one verification attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Evidence {
    Gps { point: GeoPoint, accuracy_m: f64 },
    Qr { code: String },
    Nfc {
        uid: String,
        text: Option<String>,
        uri: Option<String>,
    },
}

impl Evidence {
    pub fn method(&self) -> ProofMethod {
        match self {
            Self::Gps { .. } => ProofMethod::Gps,
            Self::Qr { .. } => ProofMethod::Qr,
            Self::Nfc { .. } => ProofMethod::Nfc,
        }
    }

    /// The raw proof recorded on the checkpoint log.
    pub fn to_proof(&self) -> ProofPayload {
        match self {
            Self::Gps { point, accuracy_m } => ProofPayload::Coordinates {
                point: *point,
                accuracy_m: *accuracy_m,
            },
            Self::Qr { code } => ProofPayload::Code { code: code.clone() },
            Self::Nfc { uid, text, uri } => ProofPayload::Tag {
                uid: uid.clone(),
                text: text.clone().or_else(|| uri.clone()),
            },
        }
    }
}

impl From<&TagRead> for Evidence {
    fn from(read: &TagRead) -> Self {
        Self::Nfc {
            uid: read.uid(),
            text: read.text.clone(),
            uri: read.uri.clone(),
        }
    }
}

/// Why a verification attempt was rejected.
#[derive(Clone, Debug, PartialEq)]
pub enum RejectReason {
    OutOfRange { distance_m: f64 },
    LowAccuracy { accuracy_m: f64 },
    PayloadMismatch,
    RoundMismatch { expected: RoundId, found: u64 },
    MalformedPayload(String),
}

impl RejectReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfRange { .. } | Self::LowAccuracy { .. } => ErrorKind::OutOfRange,
            Self::PayloadMismatch | Self::RoundMismatch { .. } => ErrorKind::PayloadMismatch,
            Self::MalformedPayload(_) => ErrorKind::MalformedPayload,
        }
    }

    /// Operator guidance for this rejection.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "move closer to the checkpoint",
            Self::LowAccuracy { .. } => "wait for a better GPS signal",
            Self::PayloadMismatch => "this code does not belong to the checkpoint, rescan",
            Self::RoundMismatch { .. } => "this tag belongs to a different round",
            Self::MalformedPayload(_) => "the tag could not be read, rescan",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { distance_m } => write!(f, "out of range ({distance_m:.1} m)"),
            Self::LowAccuracy { accuracy_m } => write!(f, "low accuracy ({accuracy_m:.1} m)"),
            Self::PayloadMismatch => f.write_str("payload does not match checkpoint"),
            Self::RoundMismatch { expected, found } => {
                write!(f, "tag belongs to round {found}, active round is {expected}")
            }
            Self::MalformedPayload(detail) => write!(f, "malformed payload: {detail}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum VerificationOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl VerificationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// GPS acceptance policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GpsPolicy {
    /// Maximum distance from the checkpoint, in meters (inclusive).
    pub radius_m: f64,
    /// Reported accuracy must be strictly below this, in meters.
    pub max_accuracy_m: f64,
}

impl Default for GpsPolicy {
    fn default() -> Self {
        Self {
            radius_m: 50.0,
            max_accuracy_m: 30.0,
        }
    }
}

/// Structured content written on checkpoint tags.
///
/// `{"id": <checkpoint>, "roundId": <round>}`; numeric strings are accepted.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TagClaim {
    #[serde(deserialize_with = "de_id")]
    pub id: u64,
    #[serde(rename = "roundId", deserialize_with = "de_id")]
    pub round_id: u64,
}

impl TagClaim {
    /// Parse a tag payload: JSON first, then URI query parameters.
    pub fn parse(payload: &str) -> Result<Self, String> {
        let trimmed = payload.trim();
        match serde_json::from_str::<TagClaim>(trimmed) {
            Ok(claim) => Ok(claim),
            Err(json_err) => Self::from_query(trimmed).ok_or_else(|| json_err.to_string()),
        }
    }

    fn from_query(uri: &str) -> Option<Self> {
        let (_, query) = uri.split_once('?')?;
        let mut id = None;
        let mut round_id = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("id", v)) => id = v.parse().ok(),
                Some(("roundId", v)) => round_id = v.parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            id: id?,
            round_id: round_id?,
        })
    }
}

fn de_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Decides whether evidence proves presence at a checkpoint.
#[derive(Clone, Debug, Default)]
pub struct ProofVerifier {
    gps: GpsPolicy,
}

impl ProofVerifier {
    pub fn new(gps: GpsPolicy) -> Self {
        Self { gps }
    }

    pub fn gps_policy(&self) -> GpsPolicy {
        self.gps
    }

    pub fn verify(
        &self,
        checkpoint: &Checkpoint,
        active_round: RoundId,
        evidence: &Evidence,
    ) -> VerificationOutcome {
        let result = match evidence {
            Evidence::Gps { point, accuracy_m } => self.verify_gps(checkpoint, *point, *accuracy_m),
            Evidence::Qr { code } => verify_qr(checkpoint, code),
            Evidence::Nfc { text, uri, .. } => {
                verify_nfc(checkpoint, active_round, text.as_deref().or(uri.as_deref()))
            }
        };
        match result {
            Ok(()) => VerificationOutcome::Accepted,
            Err(reason) => VerificationOutcome::Rejected(reason),
        }
    }

    fn verify_gps(
        &self,
        checkpoint: &Checkpoint,
        point: GeoPoint,
        accuracy_m: f64,
    ) -> Result<(), RejectReason> {
        let distance_m = haversine_m(checkpoint.location, point);
        if distance_m.is_nan() || distance_m > self.gps.radius_m {
            return Err(RejectReason::OutOfRange { distance_m });
        }
        if accuracy_m.is_nan() || accuracy_m >= self.gps.max_accuracy_m {
            return Err(RejectReason::LowAccuracy { accuracy_m });
        }
        Ok(())
    }
}

fn verify_qr(checkpoint: &Checkpoint, code: &str) -> Result<(), RejectReason> {
    match &checkpoint.tag {
        Some(bound) if bound == code => Ok(()),
        _ => Err(RejectReason::PayloadMismatch),
    }
}

fn verify_nfc(
    checkpoint: &Checkpoint,
    active_round: RoundId,
    payload: Option<&str>,
) -> Result<(), RejectReason> {
    let payload =
        payload.ok_or_else(|| RejectReason::MalformedPayload("tag carries no payload".into()))?;
    let claim = TagClaim::parse(payload).map_err(RejectReason::MalformedPayload)?;
    if claim.id != checkpoint.id.get() {
        return Err(RejectReason::PayloadMismatch);
    }
    if claim.round_id != active_round.get() {
        return Err(RejectReason::RoundMismatch {
            expected: active_round,
            found: claim.round_id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use patrol_types::CheckpointId;

    fn checkpoint(id: u64, tag: Option<&str>) -> Checkpoint {
        Checkpoint {
            id: CheckpointId::new(id),
            label: "Main gate".into(),
            location: GeoPoint::new(19.4326, -99.1332),
            tag: tag.map(str::to_string),
        }
    }

    fn nfc(text: &str) -> Evidence {
        Evidence::Nfc {
            uid: "04A1".into(),
            text: Some(text.into()),
            uri: None,
        }
    }

    #[test]
    fn gps_at_checkpoint_is_accepted() {
        let verifier = ProofVerifier::default();
        let evidence = Evidence::Gps {
            point: GeoPoint::new(19.4326, -99.1332),
            accuracy_m: 5.0,
        };
        assert_eq!(
            verifier.verify(&checkpoint(1, None), RoundId::new(1), &evidence),
            VerificationOutcome::Accepted
        );
    }

    #[test]
    fn gps_200_m_away_is_out_of_range() {
        let verifier = ProofVerifier::default();
        // 200 m north: 200 / 6_371_000 rad.
        let dlat = (200.0_f64 / 6_371_000.0).to_degrees();
        let evidence = Evidence::Gps {
            point: GeoPoint::new(19.4326 + dlat, -99.1332),
            accuracy_m: 5.0,
        };
        match verifier.verify(&checkpoint(1, None), RoundId::new(1), &evidence) {
            VerificationOutcome::Rejected(RejectReason::OutOfRange { distance_m }) => {
                assert!((distance_m - 200.0).abs() < 0.5, "got {distance_m}");
            }
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn gps_with_poor_accuracy_is_rejected() {
        let verifier = ProofVerifier::default();
        let evidence = Evidence::Gps {
            point: GeoPoint::new(19.4326, -99.1332),
            accuracy_m: 80.0,
        };
        assert!(matches!(
            verifier.verify(&checkpoint(1, None), RoundId::new(1), &evidence),
            VerificationOutcome::Rejected(RejectReason::LowAccuracy { .. })
        ));
    }

    #[test]
    fn qr_must_match_exactly() {
        let verifier = ProofVerifier::default();
        let cp = checkpoint(1, Some("CP-North-01"));
        let ok = Evidence::Qr { code: "CP-North-01".into() };
        let wrong_case = Evidence::Qr { code: "cp-north-01".into() };
        assert!(verifier.verify(&cp, RoundId::new(1), &ok).is_accepted());
        assert_eq!(
            verifier.verify(&cp, RoundId::new(1), &wrong_case),
            VerificationOutcome::Rejected(RejectReason::PayloadMismatch)
        );
    }

    #[test]
    fn qr_against_unbound_checkpoint_is_mismatch() {
        let verifier = ProofVerifier::default();
        let evidence = Evidence::Qr { code: "anything".into() };
        assert_eq!(
            verifier.verify(&checkpoint(1, None), RoundId::new(1), &evidence),
            VerificationOutcome::Rejected(RejectReason::PayloadMismatch)
        );
    }

    #[test]
    fn nfc_matching_round_is_accepted() {
        let verifier = ProofVerifier::default();
        let evidence = nfc(r#"{"id":1,"roundId":10}"#);
        assert!(verifier
            .verify(&checkpoint(1, None), RoundId::new(10), &evidence)
            .is_accepted());
    }

    #[test]
    fn nfc_other_round_is_round_mismatch() {
        let verifier = ProofVerifier::default();
        let evidence = nfc(r#"{"id":1,"roundId":10}"#);
        assert_eq!(
            verifier.verify(&checkpoint(1, None), RoundId::new(11), &evidence),
            VerificationOutcome::Rejected(RejectReason::RoundMismatch {
                expected: RoundId::new(11),
                found: 10,
            })
        );
    }

    #[test]
    fn nfc_other_checkpoint_is_payload_mismatch() {
        let verifier = ProofVerifier::default();
        let evidence = nfc(r#"{"id":2,"roundId":10}"#);
        assert_eq!(
            verifier.verify(&checkpoint(1, None), RoundId::new(10), &evidence),
            VerificationOutcome::Rejected(RejectReason::PayloadMismatch)
        );
    }

    #[test]
    fn nfc_garbage_is_malformed() {
        let verifier = ProofVerifier::default();
        for payload in ["not json", r#"{"id":1}"#, r#"{"id":"x","roundId":1}"#] {
            assert!(matches!(
                verifier.verify(&checkpoint(1, None), RoundId::new(1), &nfc(payload)),
                VerificationOutcome::Rejected(RejectReason::MalformedPayload(_))
            ));
        }
    }

    #[test]
    fn nfc_without_payload_is_malformed() {
        let verifier = ProofVerifier::default();
        let evidence = Evidence::Nfc {
            uid: "04A1".into(),
            text: None,
            uri: None,
        };
        assert!(matches!(
            verifier.verify(&checkpoint(1, None), RoundId::new(1), &evidence),
            VerificationOutcome::Rejected(RejectReason::MalformedPayload(_))
        ));
    }

    #[test]
    fn tag_claim_accepts_numeric_strings_and_uri_queries() {
        assert_eq!(
            TagClaim::parse(r#"{"id":"3","roundId":"12"}"#),
            Ok(TagClaim { id: 3, round_id: 12 })
        );
        assert_eq!(
            TagClaim::parse("https://patrol.example/cp?id=3&roundId=12"),
            Ok(TagClaim { id: 3, round_id: 12 })
        );
    }

    #[test]
    fn nfc_uri_payload_is_used_when_text_is_absent() {
        let verifier = ProofVerifier::default();
        let evidence = Evidence::Nfc {
            uid: "04A1".into(),
            text: None,
            uri: Some("https://patrol.example/cp?id=1&roundId=10".into()),
        };
        assert!(verifier
            .verify(&checkpoint(1, None), RoundId::new(10), &evidence)
            .is_accepted());
    }
}
