//! Device capability interfaces for the two NFC session models.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::TagError;

/// Bytes of an NDEF field as delivered by the platform driver.
///
/// Drivers hand over either a raw byte buffer or a JSON value: a plain array
/// of byte values, an object wrapping a `data` array, or a binary string with
/// one byte per character.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadBytes {
    Buffer(Vec<u8>),
    Json(serde_json::Value),
}

impl PayloadBytes {
    /// Normalize every representation to one byte sequence.
    ///
    /// Unrecognized shapes yield an empty sequence; array values outside
    /// `0..=255` are skipped.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Buffer(bytes) => bytes.clone(),
            Self::Json(value) => json_bytes(value),
        }
    }
}

impl Default for PayloadBytes {
    fn default() -> Self {
        Self::Buffer(Vec::new())
    }
}

impl From<Vec<u8>> for PayloadBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffer(bytes)
    }
}

impl From<&[u8]> for PayloadBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::Buffer(bytes.to_vec())
    }
}

fn json_bytes(value: &serde_json::Value) -> Vec<u8> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_u64())
            .filter_map(|n| u8::try_from(n).ok())
            .collect(),
        serde_json::Value::Object(map) => map.get("data").map(json_bytes).unwrap_or_default(),
        serde_json::Value::String(s) => string_bytes(s),
        _ => Vec::new(),
    }
}

/// A binary string maps each char to one byte. Strings with chars above
/// U+00FF are not binary strings; their UTF-8 encoding is used instead.
fn string_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect::<Option<Vec<u8>>>()
        .unwrap_or_else(|| s.as_bytes().to_vec())
}

/// One NDEF record as reported by the driver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NdefRecord {
    /// Type Name Format (3 bits).
    pub tnf: u8,
    #[serde(rename = "type", default)]
    pub record_type: PayloadBytes,
    #[serde(default)]
    pub payload: PayloadBytes,
}

/// A tag as presented by the driver, before decoding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTag {
    /// Tag UID.
    #[serde(default)]
    pub id: PayloadBytes,
    #[serde(default, rename = "techTypes")]
    pub tech_types: Vec<String>,
    #[serde(default, rename = "ndefMessage")]
    pub ndef_message: Vec<NdefRecord>,
}

impl RawTag {
    /// UID rendered as uppercase hex.
    pub fn uid_hex(&self) -> String {
        hex::encode_upper(self.id.to_bytes())
    }
}

/// Capability of a driver using the polling session model.
#[async_trait]
pub trait PollingNfc: Send + Sync {
    async fn is_supported(&self) -> bool;

    async fn is_enabled(&self) -> bool;

    /// Open a technology session and wait until a tag is presented.
    async fn request_technology(&self, prompt: &str) -> Result<(), TagError>;

    /// Read the tag held by the open technology session.
    async fn get_tag(&self) -> Result<RawTag, TagError>;

    /// Close the technology session. Must be safe to call when none is open.
    async fn cancel_technology_request(&self);
}

/// Callback invoked by an event-model driver on discovery or session error.
pub type TagListener = Box<dyn Fn(Result<RawTag, TagError>) + Send + Sync>;

/// Capability of a driver using the event session model.
#[async_trait]
pub trait EventNfc: Send + Sync {
    async fn is_supported(&self) -> bool;

    async fn is_enabled(&self) -> bool;

    /// Install (`Some`) or remove (`None`) the discovery listener.
    fn set_discovery_listener(&self, listener: Option<TagListener>);

    /// Start a reading session; discoveries are delivered to the listener.
    async fn register_tag_event(&self, prompt: &str) -> Result<(), TagError>;

    /// Stop the reading session. Must be safe to call when none is open.
    async fn unregister_tag_event(&self);
}

/// The platform's NFC capability, selected at runtime.
#[derive(Clone)]
pub enum NfcDevice {
    Polling(Arc<dyn PollingNfc>),
    Event(Arc<dyn EventNfc>),
}

impl NfcDevice {
    pub async fn is_supported(&self) -> bool {
        match self {
            Self::Polling(d) => d.is_supported().await,
            Self::Event(d) => d.is_supported().await,
        }
    }

    pub async fn is_enabled(&self) -> bool {
        match self {
            Self::Polling(d) => d.is_enabled().await,
            Self::Event(d) => d.is_enabled().await,
        }
    }

    pub fn model(&self) -> &'static str {
        match self {
            Self::Polling(_) => "polling",
            Self::Event(_) => "event",
        }
    }
}

impl std::fmt::Debug for NfcDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NfcDevice").field(&self.model()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_plain_array() {
        let bytes = PayloadBytes::Json(json!([2, 101, 110, 104, 105]));
        assert_eq!(bytes.to_bytes(), vec![2, 101, 110, 104, 105]);
    }

    #[test]
    fn normalizes_wrapped_data_object() {
        let bytes = PayloadBytes::Json(json!({"type": "Buffer", "data": [1, 2, 3]}));
        assert_eq!(bytes.to_bytes(), vec![1, 2, 3]);
    }

    #[test]
    fn raw_buffer_passes_through() {
        assert_eq!(PayloadBytes::from(vec![9, 8]).to_bytes(), vec![9, 8]);
    }

    #[test]
    fn binary_string_is_one_byte_per_char() {
        let bytes = PayloadBytes::Json(json!("\u{2}en\u{ff}"));
        assert_eq!(bytes.to_bytes(), vec![2, b'e', b'n', 0xFF]);
        let wide = PayloadBytes::Json(json!("é✓"));
        assert_eq!(wide.to_bytes(), "é✓".as_bytes().to_vec());
    }

    #[test]
    fn unrecognized_shape_is_empty() {
        assert!(PayloadBytes::Json(json!({"bytes": [1]})).to_bytes().is_empty());
        assert!(PayloadBytes::Json(json!(null)).to_bytes().is_empty());
    }

    #[test]
    fn out_of_range_values_are_skipped() {
        let bytes = PayloadBytes::Json(json!([1, 300, -1, 2, "x"]));
        assert_eq!(bytes.to_bytes(), vec![1, 2]);
    }

    #[test]
    fn raw_tag_deserializes_driver_shape() {
        let tag: RawTag = serde_json::from_value(json!({
            "id": [4, 161, 178],
            "techTypes": ["android.nfc.tech.Ndef"],
            "ndefMessage": [{"tnf": 1, "type": [84], "payload": {"data": [2, 101, 110, 104]}}]
        }))
        .unwrap();
        assert_eq!(tag.uid_hex(), "04A1B2");
        assert_eq!(tag.ndef_message[0].payload.to_bytes(), vec![2, 101, 110, 104]);
    }
}
