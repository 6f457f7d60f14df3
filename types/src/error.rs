//! Error taxonomy shared across crates.
//!
//! Each crate keeps its own `thiserror` enum; every one of them maps onto an
//! [`ErrorKind`] so callers can pick the right user-facing reaction without
//! matching on crate-specific variants.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// NFC (or another device capability) is off or unsupported.
    HardwareUnavailable,
    /// A tag read, location fix or network call ran out of time.
    Timeout,
    /// The user dismissed an in-flight device operation.
    Cancelled,
    /// A device session failed mid-operation; the user is re-prompted.
    DeviceError,
    /// Proof payload did not match the checkpoint or round.
    PayloadMismatch,
    /// GPS evidence is too far from the checkpoint or too inaccurate.
    OutOfRange,
    /// Proof payload could not be parsed.
    MalformedPayload,
    /// A submission for the same checkpoint is already in flight.
    AlreadyPending,
    /// The server authoritatively refused the request.
    ServerRejected,
    /// No connectivity; the caller should retry.
    NetworkUnavailable,
    /// An emit was attempted on a socket that is not connected.
    Disconnected,
    /// The operation is not allowed in the current round state.
    InvalidState,
}

impl ErrorKind {
    /// Errors that warrant a retry affordance.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::DeviceError | Self::NetworkUnavailable | Self::Disconnected
        )
    }

    /// Errors the operator can fix (move closer, rescan).
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Self::PayloadMismatch | Self::OutOfRange | Self::MalformedPayload
        )
    }

    /// Errors that disable the corresponding proof method for the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::HardwareUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
