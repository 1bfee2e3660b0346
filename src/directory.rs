//! Chat participation lookup, owned by the chat persistence service.
//!
//! The transport layer asks it which chats to subscribe a fresh connection to, and whether a
//! `join_chat` request is allowed. The realtime core itself never calls it.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::ids::{RoomId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("chat directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ChatDirectory: Send + Sync {
    /// Chats the user currently participates in.
    async fn chats_of(&self, uid: &UserId) -> Result<Vec<RoomId>, DirectoryError>;

    async fn is_participant(&self, chat_id: &RoomId, uid: &UserId) -> Result<bool, DirectoryError>;
}

/// In-process directory for development and tests.
#[derive(Default)]
pub struct InMemoryChatDirectory {
    participants: DashMap<RoomId, HashSet<UserId>>,
}

impl InMemoryChatDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_participant(&self, chat_id: RoomId, uid: UserId) {
        self.participants.entry(chat_id).or_default().insert(uid);
    }

    pub fn remove_participant(&self, chat_id: &RoomId, uid: &UserId) {
        self.participants.remove_if_mut(chat_id, |_, members| {
            members.remove(uid);
            members.is_empty()
        });
    }
}

#[async_trait]
impl ChatDirectory for InMemoryChatDirectory {
    async fn chats_of(&self, uid: &UserId) -> Result<Vec<RoomId>, DirectoryError> {
        Ok(self
            .participants
            .iter()
            .filter(|chat| chat.value().contains(uid))
            .map(|chat| *chat.key())
            .collect())
    }

    async fn is_participant(&self, chat_id: &RoomId, uid: &UserId) -> Result<bool, DirectoryError> {
        Ok(self
            .participants
            .get(chat_id)
            .map(|members| members.contains(uid))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_participation() {
        let directory = InMemoryChatDirectory::new();
        let uid = UserId::new();
        let chat = RoomId::new();
        directory.add_participant(chat, uid);
        directory.add_participant(RoomId::new(), UserId::new());

        assert_eq!(directory.chats_of(&uid).await.unwrap(), vec![chat]);
        assert!(directory.is_participant(&chat, &uid).await.unwrap());

        directory.remove_participant(&chat, &uid);
        assert!(directory.chats_of(&uid).await.unwrap().is_empty());
        assert!(!directory.is_participant(&chat, &uid).await.unwrap());
    }
}
