//! Nullable infrastructure for deterministic testing.
//!
//! Every external boundary of the patrol client (clock, NFC driver, location
//! source, round HTTP API, socket link) is a trait. This crate provides
//! test-friendly implementations that:
//! - Return deterministic values
//! - Can be controlled programmatically
//! - Record what was asked of them for assertions
//! - Never touch hardware or the network
//!
//! Usage: swap real implementations for nullables in tests.

pub mod clock;
pub mod link;
pub mod location;
pub mod nfc;
pub mod rounds;

pub use clock::NullClock;
pub use link::{NullConnector, NullLinkHandle};
pub use location::NullLocationSource;
pub use nfc::{text_tag, uri_tag, NullEventNfc, NullPollingNfc};
pub use rounds::{checkpoint, round_detail, ApiCall, NullRoundApi};
