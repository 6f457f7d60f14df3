//! Real-time socket transport.
//!
//! One [`Connection`] per [`Namespace`], owned by a [`ConnectionRegistry`]
//! and shared by every consumer. A connection keeps itself connected until it
//! is disposed: an unexpected disconnect schedules a reconnection with linear
//! backoff, and the session token is re-read on every attempt.
//!
//! Wire format is Engine.IO v4 / Socket.IO text framing (see [`codec`]). The
//! byte pipe underneath is the [`Link`] seam, implemented over WebSockets by
//! [`WsConnector`].

pub mod backoff;
pub mod chat;
pub mod codec;
pub mod connection;
pub mod connector;
pub mod error;
pub mod namespace;
pub mod registry;
pub mod tracking;

pub use backoff::ReconnectPolicy;
pub use chat::{ChatChannel, ChatMessage, Conversation, OutgoingMessage};
pub use codec::{EnginePacket, PacketKind, SocketPacket};
pub use connection::{Connection, ConnectionState, Handler, Subscription};
pub use connector::{Connector, Link, WsConnector};
pub use error::TransportError;
pub use namespace::Namespace;
pub use registry::ConnectionRegistry;
pub use tracking::{
    CheckpointConfirmedPush, CheckpointRejectedPush, LocationBatch, LocationBatcher,
    LocationSample, TrackingChannel,
};

/// Local lifecycle events dispatched to listeners alongside server events.
pub mod events {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const CONNECT_ERROR: &str = "connect_error";
}
