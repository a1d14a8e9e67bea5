use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{FriendRecord, MessageRecord, MessageStore, Subscription};
use crate::error::StoreError;
use crate::message_hub::{self, MessageHub};
use crate::unread::{CorrespondentId, UserId};

#[derive(Default)]
struct MemoryData {
    display_names: HashMap<UserId, String>,
    /// user -> friends, in insertion order
    friends: HashMap<UserId, Vec<UserId>>,
    messages: Vec<MessageRecord>,
    unavailable: bool,
    fail_mark_read: bool,
    mark_read_delay: Option<Duration>,
}

/// In-process message store used for fixtures and local runs.
/// Supports injecting an outage, failing mark-read mutations, and slow mutations.
pub struct MemoryStore {
    data: Mutex<MemoryData>,
    hub: MessageHub,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(MemoryData::default()),
            hub: message_hub::new_hub(),
        }
    }

    pub fn hub(&self) -> &MessageHub {
        &self.hub
    }

    pub async fn set_display_name(&self, user: &UserId, display_name: &str) {
        let mut data = self.data.lock().await;
        data.display_names
            .insert(user.clone(), display_name.to_string());
    }

    /// Make `a` and `b` friends of each other.
    pub async fn add_friendship(&self, a: &UserId, b: &UserId) {
        let mut data = self.data.lock().await;
        for (user, friend) in [(a, b), (b, a)] {
            let list = data.friends.entry(user.clone()).or_default();
            if !list.contains(friend) {
                list.push(friend.clone());
            }
        }
    }

    /// Store a new unread message and deliver it to live subscribers.
    pub async fn send_message(
        &self,
        sender: &UserId,
        receiver: &UserId,
        content: &str,
    ) -> MessageRecord {
        let message = MessageRecord {
            id: Uuid::new_v4(),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            content: content.to_string(),
            read: false,
            created_at: Utc::now(),
        };
        self.data.lock().await.messages.push(message.clone());
        message_hub::publish(&self.hub, &message);
        message
    }

    /// Deliver a message to subscribers again without storing it.
    pub fn redeliver(&self, message: &MessageRecord) {
        message_hub::publish(&self.hub, message);
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.data.lock().await.unavailable = unavailable;
    }

    pub async fn set_fail_mark_read(&self, fail: bool) {
        self.data.lock().await.fail_mark_read = fail;
    }

    pub async fn set_mark_read_delay(&self, delay: Option<Duration>) {
        self.data.lock().await.mark_read_delay = delay;
    }

    fn check_available(data: &MemoryData) -> Result<(), StoreError> {
        if data.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get_unread_message_count(&self, user: &UserId) -> Result<u64, StoreError> {
        let data = self.data.lock().await;
        Self::check_available(&data)?;
        Ok(data
            .messages
            .iter()
            .filter(|m| &m.receiver_id == user && !m.read)
            .count() as u64)
    }

    async fn get_friends(&self, user: &UserId) -> Result<Vec<FriendRecord>, StoreError> {
        let data = self.data.lock().await;
        Self::check_available(&data)?;
        let friends = data.friends.get(user).cloned().unwrap_or_default();
        Ok(friends
            .into_iter()
            .map(|friend_id| FriendRecord {
                display_name: data
                    .display_names
                    .get(&friend_id)
                    .cloned()
                    .unwrap_or_else(|| friend_id.to_string()),
                friend_id,
            })
            .collect())
    }

    async fn get_messages(
        &self,
        user: &UserId,
        correspondent: &CorrespondentId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let data = self.data.lock().await;
        Self::check_available(&data)?;
        Ok(data
            .messages
            .iter()
            .filter(|m| {
                (&m.sender_id == user && &m.receiver_id == correspondent)
                    || (&m.sender_id == correspondent && &m.receiver_id == user)
            })
            .cloned()
            .collect())
    }

    async fn mark_messages_as_read(
        &self,
        user: &UserId,
        correspondent: &CorrespondentId,
    ) -> Result<(), StoreError> {
        let delay = self.data.lock().await.mark_read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut data = self.data.lock().await;
        Self::check_available(&data)?;
        if data.fail_mark_read {
            return Err(StoreError::Unavailable("mark read rejected".to_string()));
        }
        for message in data
            .messages
            .iter_mut()
            .filter(|m| &m.sender_id == correspondent && &m.receiver_id == user)
        {
            message.read = true;
        }
        Ok(())
    }

    async fn subscribe_to_messages(&self, user: &UserId) -> Result<Subscription, StoreError> {
        Self::check_available(&*self.data.lock().await)?;
        Ok(Subscription::open(&self.hub, user))
    }
}
