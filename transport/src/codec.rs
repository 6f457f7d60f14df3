//! Engine.IO v4 / Socket.IO text packet codec.
//!
//! An Engine.IO frame is a one-digit packet type followed by its data. A
//! `message` frame (`4`) carries a Socket.IO packet:
//!
//! ```text
//! <type>[<namespace>,][<ack id>][<json>]
//! 42/tracking,["location_batch",{...}]
//! 43/chat,7[{"ok":true}]
//! ```
//!
//! The default namespace `/` is written without a prefix. Binary attachments
//! are not supported.

use serde_json::Value;

use crate::TransportError;

#[derive(Clone, Debug, PartialEq)]
pub enum EnginePacket {
    /// Handshake from the server (`sid`, ping interval, ping timeout).
    Open(Value),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn encode(&self) -> String {
        match self {
            Self::Open(data) => format!("0{data}"),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{}", data.as_deref().unwrap_or("")),
            Self::Pong(data) => format!("3{}", data.as_deref().unwrap_or("")),
            Self::Message(packet) => format!("4{}", packet.encode()),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }

    pub fn decode(frame: &str) -> Result<Self, TransportError> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| TransportError::Codec("empty frame".into()))?;
        let rest = chars.as_str();
        let data = || (!rest.is_empty()).then(|| rest.to_string());
        match kind {
            '0' => serde_json::from_str(rest)
                .map(Self::Open)
                .map_err(|e| TransportError::Codec(format!("bad open payload: {e}"))),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(data())),
            '3' => Ok(Self::Pong(data())),
            '4' => SocketPacket::decode(rest).map(Self::Message),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(TransportError::Codec(format!(
                "unknown engine packet type {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
}

impl PacketKind {
    fn digit(&self) -> char {
        match self {
            Self::Connect => '0',
            Self::Disconnect => '1',
            Self::Event => '2',
            Self::Ack => '3',
            Self::ConnectError => '4',
        }
    }

    fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Connect),
            '1' => Some(Self::Disconnect),
            '2' => Some(Self::Event),
            '3' => Some(Self::Ack),
            '4' => Some(Self::ConnectError),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SocketPacket {
    pub kind: PacketKind,
    pub namespace: String,
    pub ack_id: Option<u64>,
    pub data: Option<Value>,
}

impl SocketPacket {
    /// Namespace handshake, optionally carrying an auth payload.
    pub fn connect(namespace: &str, auth: Option<Value>) -> Self {
        Self {
            kind: PacketKind::Connect,
            namespace: namespace.to_string(),
            ack_id: None,
            data: auth,
        }
    }

    pub fn disconnect(namespace: &str) -> Self {
        Self {
            kind: PacketKind::Disconnect,
            namespace: namespace.to_string(),
            ack_id: None,
            data: None,
        }
    }

    /// `[event, payload]`, requesting an acknowledgement when `ack_id` is set.
    pub fn event(namespace: &str, event: &str, payload: Value, ack_id: Option<u64>) -> Self {
        Self {
            kind: PacketKind::Event,
            namespace: namespace.to_string(),
            ack_id,
            data: Some(Value::Array(vec![Value::String(event.to_string()), payload])),
        }
    }

    pub fn ack(namespace: &str, ack_id: u64, args: Vec<Value>) -> Self {
        Self {
            kind: PacketKind::Ack,
            namespace: namespace.to_string(),
            ack_id: Some(ack_id),
            data: Some(Value::Array(args)),
        }
    }

    /// Event name and first argument (`Null` when the event has none).
    pub fn event_parts(&self) -> Option<(&str, Value)> {
        if self.kind != PacketKind::Event {
            return None;
        }
        let items = self.data.as_ref()?.as_array()?;
        let name = items.first()?.as_str()?;
        Some((name, items.get(1).cloned().unwrap_or(Value::Null)))
    }

    /// First acknowledgement argument (`Null` when the ack is empty).
    pub fn ack_value(&self) -> Value {
        self.data
            .as_ref()
            .and_then(|d| d.as_array())
            .and_then(|args| args.first().cloned())
            .unwrap_or(Value::Null)
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.digit());
        if self.namespace != "/" {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let mut chars = text.chars();
        let digit = chars
            .next()
            .ok_or_else(|| TransportError::Codec("empty socket packet".into()))?;
        let kind = PacketKind::from_digit(digit).ok_or_else(|| {
            TransportError::Codec(format!("unsupported socket packet type {digit:?}"))
        })?;
        let mut rest = chars.as_str();

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(comma) => {
                    let ns = &rest[..comma];
                    rest = &rest[comma + 1..];
                    ns.to_string()
                }
                None => {
                    let ns = rest.to_string();
                    rest = "";
                    ns
                }
            }
        } else {
            "/".to_string()
        };

        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse()
                .map_err(|e| TransportError::Codec(format!("bad ack id: {e}")))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(rest)
                    .map_err(|e| TransportError::Codec(format!("bad packet data: {e}")))?,
            )
        };

        Ok(Self {
            kind,
            namespace,
            ack_id,
            data,
        })
    }
}
