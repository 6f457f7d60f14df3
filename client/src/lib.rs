//! Patrol client session.
//!
//! Owns the pieces a logged-in operator uses: the connection registry, the
//! round machine, the evidence collector and the live location feed. UI
//! layers (and the CLI) talk to a [`Session`].

pub mod config;
pub mod error;
pub mod session;

pub use config::ClientConfig;
pub use error::ClientError;
pub use session::{Session, SessionParts};
