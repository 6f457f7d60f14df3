//! Round lifecycle state machine.
//!
//! The server is the authority on round state. The machine applies local
//! transitions optimistically (a checkpoint log goes `Pending` the moment
//! local verification passes) and overwrites them with whatever the server
//! reports, whether that arrives as an HTTP response or a socket push.

pub mod api;
pub mod error;
pub mod event;
pub mod http;
pub mod machine;

pub use api::{CheckpointSubmission, Envelope, RoundApi, RoundDetail, ServerLog};
pub use error::{ApiError, RoundError};
pub use event::RoundEvent;
pub use http::HttpRoundApi;
pub use machine::{ApplyEffect, Confirmation, MachineConfig, RetryReport, RoundMachine};
