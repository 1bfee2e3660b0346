//! WebSocket protocol: JSON text frames tagged by `type`.
//!
//! Message and chat bodies are DTOs produced by the chat service and passed through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ids::{RoomId, UserId};

/// Server -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived { chat_id: RoomId, message: Value },
    MessageUpdated { chat_id: RoomId, message: Value },
    MessageDeleted { chat_id: RoomId, message_id: Uuid },
    NewChatCreated { chat_id: RoomId, user_ids: Vec<UserId>, chat: Value },
    ChatUpdated { chat_id: RoomId, chat: Value },
    NewMemberAdded { chat_id: RoomId, new_member: Value },
    UserLeftChat { chat_id: RoomId, user_id: UserId },
    Subscribed { chat_id: RoomId },
    Unsubscribed { chat_id: RoomId },
    Error { message: String },
    Pong,
}

impl ServerEvent {
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client -> server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    JoinChat { chat_id: RoomId },
    LeaveChat { chat_id: RoomId },
}
