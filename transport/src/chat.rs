//! Typed events of the `/chat` namespace.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use patrol_types::Timestamp;

use crate::{Connection, Subscription, TransportError};

pub const JOIN_ROOM: &str = "join_room";
pub const SEND_MESSAGE: &str = "send_message";
pub const RECEIVE_MESSAGE: &str = "receive_message";
pub const USER_CONVERSATIONS: &str = "user_conversations";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub room_id: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub room_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
    #[serde(default)]
    pub unread: u32,
}

/// Chat view over the shared `/chat` connection.
#[derive(Clone)]
pub struct ChatChannel {
    connection: Arc<Connection>,
}

impl ChatChannel {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn join_room(&self, room_id: &str) -> Result<(), TransportError> {
        self.connection.emit(JOIN_ROOM, json!({ "roomId": room_id }))
    }

    pub fn send_message(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let payload =
            serde_json::to_value(message).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.connection.emit(SEND_MESSAGE, payload)
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ChatMessage) + Send + Sync + 'static,
    {
        self.connection.on_json(RECEIVE_MESSAGE, handler)
    }

    pub fn on_conversations<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Vec<Conversation>) + Send + Sync + 'static,
    {
        self.connection.on_json(USER_CONVERSATIONS, handler)
    }
}
