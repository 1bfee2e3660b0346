//! Typed entry point for the chat service: call after a mutation has been committed.

use serde_json::Value;
use uuid::Uuid;

use crate::events::ServerEvent;
use crate::fanout::{DeliveryReport, EventFanout};
use crate::ids::{RoomId, UserId};

#[derive(Clone)]
pub struct MessengerNotifier {
    fanout: EventFanout,
}

impl MessengerNotifier {
    pub fn new(fanout: EventFanout) -> Self {
        Self { fanout }
    }

    pub fn fanout(&self) -> &EventFanout {
        &self.fanout
    }

    pub async fn message_received(&self, chat_id: RoomId, message: Value) -> DeliveryReport {
        self.to_room(chat_id, ServerEvent::MessageReceived { chat_id, message })
            .await
    }

    pub async fn message_updated(&self, chat_id: RoomId, message: Value) -> DeliveryReport {
        self.to_room(chat_id, ServerEvent::MessageUpdated { chat_id, message })
            .await
    }

    pub async fn message_deleted(&self, chat_id: RoomId, message_id: Uuid) -> DeliveryReport {
        self.to_room(chat_id, ServerEvent::MessageDeleted { chat_id, message_id })
            .await
    }

    pub async fn chat_updated(&self, chat_id: RoomId, chat: Value) -> DeliveryReport {
        self.to_room(chat_id, ServerEvent::ChatUpdated { chat_id, chat })
            .await
    }

    /// Participants of a new chat are not subscribed to it yet, so this goes to users directly.
    pub async fn new_chat_created(
        &self,
        chat_id: RoomId,
        user_ids: Vec<UserId>,
        chat: Value,
    ) -> DeliveryReport {
        let event = ServerEvent::NewChatCreated {
            chat_id,
            user_ids: user_ids.clone(),
            chat,
        };
        match encode(&event) {
            Some(payload) => self.fanout.publish_to_users(&user_ids, payload).await,
            None => DeliveryReport::default(),
        }
    }

    pub async fn new_member_added(
        &self,
        chat_id: RoomId,
        uid: UserId,
        new_member: Value,
    ) -> DeliveryReport {
        match encode(&ServerEvent::NewMemberAdded { chat_id, new_member }) {
            Some(payload) => self.fanout.add_member_and_notify(chat_id, uid, payload).await,
            None => DeliveryReport::default(),
        }
    }

    pub async fn user_left_chat(&self, chat_id: RoomId, uid: UserId) -> DeliveryReport {
        match encode(&ServerEvent::UserLeftChat { chat_id, user_id: uid }) {
            Some(payload) => {
                self.fanout
                    .remove_member_and_notify(chat_id, uid, payload)
                    .await
            }
            None => DeliveryReport::default(),
        }
    }

    async fn to_room(&self, chat_id: RoomId, event: ServerEvent) -> DeliveryReport {
        match encode(&event) {
            Some(payload) => self.fanout.publish(chat_id, payload).await,
            None => DeliveryReport::default(),
        }
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match event.to_payload() {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::error!("serialize server event: {:?}", e);
            None
        }
    }
}
