//! NDEF record decoding.
//!
//! Only the first record of a message is inspected. Well-known text (`T`)
//! and URI (`U`) records are decoded; anything else yields no payload, which
//! is not an error. The caller decides whether a payload is required.

use crate::NdefRecord;

/// TNF value for NFC Forum well-known types.
pub const TNF_WELL_KNOWN: u8 = 0x01;

const RTD_TEXT: &[u8] = b"T";
const RTD_URI: &[u8] = b"U";

/// URI identifier codes (NFC Forum URI RTD, table 3).
const URI_PREFIXES: [&str; 36] = [
    "",
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
    "ftps://",
    "sftp://",
    "smb://",
    "nfs://",
    "ftp://",
    "dav://",
    "news:",
    "telnet://",
    "imap:",
    "rtsp://",
    "urn:",
    "pop:",
    "sip:",
    "sips:",
    "tftp:",
    "btspp://",
    "btl2cap://",
    "btgoep://",
    "tcpobex://",
    "irdaobex://",
    "file://",
    "urn:epc:id:",
    "urn:epc:tag:",
    "urn:epc:pat:",
    "urn:epc:raw:",
    "urn:epc:",
    "urn:nfc:",
];

/// Decoded content of the first NDEF record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedPayload {
    Text(String),
    Uri(String),
}

/// Decode the first record of an NDEF message, if it is text or URI.
pub fn decode_first_record(records: &[NdefRecord]) -> Option<DecodedPayload> {
    let record = records.first()?;
    if record.tnf != TNF_WELL_KNOWN {
        return None;
    }
    let record_type = record.record_type.to_bytes();
    let payload = record.payload.to_bytes();
    match record_type.as_slice() {
        RTD_TEXT => decode_text(&payload).map(DecodedPayload::Text),
        RTD_URI => decode_uri(&payload).map(DecodedPayload::Uri),
        _ => None,
    }
}

/// Decode a well-known text record payload.
///
/// Status byte: bit 7 selects UTF-16, bits 0..=5 hold the language code length.
pub fn decode_text(payload: &[u8]) -> Option<String> {
    let (&status, rest) = payload.split_first()?;
    let lang_len = (status & 0x3F) as usize;
    if rest.len() < lang_len {
        return None;
    }
    let text = &rest[lang_len..];
    if status & 0x80 != 0 {
        Some(decode_utf16(text))
    } else {
        Some(String::from_utf8_lossy(text).into_owned())
    }
}

fn decode_utf16(bytes: &[u8]) -> String {
    let (little_endian, body) = match bytes {
        [0xFF, 0xFE, rest @ ..] => (true, rest),
        [0xFE, 0xFF, rest @ ..] => (false, rest),
        _ => (false, bytes),
    };
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

/// Decode a well-known URI record payload (prefix code + remainder).
pub fn decode_uri(payload: &[u8]) -> Option<String> {
    let (&code, rest) = payload.split_first()?;
    let prefix = URI_PREFIXES.get(code as usize).copied().unwrap_or("");
    Some(format!("{prefix}{}", String::from_utf8_lossy(rest)))
}
