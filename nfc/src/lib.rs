//! NFC tag reader.
//!
//! Drives the device NFC capability through one of two session models and
//! decodes the first NDEF record of the presented tag:
//! - **Polling**: open a technology session, wait for a tag, read it, and
//!   always close the session afterwards.
//! - **Event**: register a discovery listener plus a reading session; the
//!   first discovery resolves the read exactly once.
//!
//! Both models are selected at runtime through [`NfcDevice`], so callers never
//! see which platform they run on.

pub mod device;
pub mod error;
pub mod ndef;
pub mod reader;

pub use device::{
    EventNfc, NdefRecord, NfcDevice, PayloadBytes, PollingNfc, RawTag, TagListener,
};
pub use error::TagError;
pub use ndef::{decode_first_record, DecodedPayload};
pub use reader::{NfcConfig, ScanCancel, TagRead, TagReader};
