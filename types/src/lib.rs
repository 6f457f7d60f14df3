//! Fundamental types for the patrol core.
//!
//! This crate defines the data model shared across every other crate in the
//! workspace: identifiers, timestamps, coordinates, rounds, checkpoints,
//! checkpoint logs and the shared error taxonomy.

pub mod auth;
pub mod checkpoint;
pub mod error;
pub mod geo;
pub mod ids;
pub mod round;
pub mod time;

pub use auth::{static_token, TokenProvider};
pub use checkpoint::{
    Checkpoint, CheckpointLog, LogStatus, ProofMethod, ProofPayload, RejectionReason,
};
pub use error::ErrorKind;
pub use geo::GeoPoint;
pub use ids::{CheckpointId, RoundId};
pub use round::{Round, RoundStatus};
pub use time::{Clock, SystemClock, Timestamp};
