//! Checkpoint proof-of-presence verification.
//!
//! Split in two halves:
//! - [`ProofVerifier`] is pure: given already-acquired evidence it returns a
//!   decision, with no I/O.
//! - [`EvidenceCollector`] acquires evidence from the device (location fix,
//!   NFC read, scanned QR text) under bounded timeouts. It never decides
//!   acceptance.

pub mod error;
pub mod evidence;
pub mod geo;
pub mod verifier;

pub use error::VerificationError;
pub use evidence::{EvidenceCollector, LocationFix, LocationSource, DEFAULT_LOCATION_TIMEOUT};
pub use geo::haversine_m;
pub use verifier::{
    Evidence, GpsPolicy, ProofVerifier, RejectReason, TagClaim, VerificationOutcome,
};
