//! The message store as seen by the notification tracker.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::message_hub::{self, MessageHub};
use crate::unread::{CorrespondentId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: Uuid,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRecord {
    pub friend_id: CorrespondentId,
    pub display_name: String,
}

#[async_trait]
pub trait MessageStore: Sync + Send {
    /// Count every unread message addressed to `user`.
    async fn get_unread_message_count(&self, user: &UserId) -> Result<u64, StoreError>;

    /// Fetch the accepted friends of `user`.
    async fn get_friends(&self, user: &UserId) -> Result<Vec<FriendRecord>, StoreError>;

    /// Fetch every message exchanged between `user` and `correspondent`.
    async fn get_messages(
        &self,
        user: &UserId,
        correspondent: &CorrespondentId,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Mark every message from `correspondent` to `user` as read.
    async fn mark_messages_as_read(
        &self,
        user: &UserId,
        correspondent: &CorrespondentId,
    ) -> Result<(), StoreError>;

    /// Open a live feed of new messages involving `user`.
    async fn subscribe_to_messages(&self, user: &UserId) -> Result<Subscription, StoreError>;
}

/// Live message feed for one user, read straight from the hub.
/// Released exactly once: by [`Subscription::unsubscribe`] or on drop.
pub struct Subscription {
    stream: Option<BroadcastStream<MessageRecord>>,
    hub: MessageHub,
    user: UserId,
}

impl Subscription {
    /// Attach to `user`'s channel, creating it if needed.
    pub fn open(hub: &MessageHub, user: &UserId) -> Self {
        Self {
            stream: Some(BroadcastStream::new(message_hub::subscribe(hub, user))),
            hub: hub.clone(),
            user: user.clone(),
        }
    }

    /// Next message, or None once the feed has closed.
    /// A lagging receiver skips the dropped events.
    pub async fn recv(&mut self) -> Option<MessageRecord> {
        let stream = self.stream.as_mut()?;
        loop {
            match stream.next().await? {
                Ok(message) => return Some(message),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(user_id = %self.user, skipped, "message subscription lagged");
                }
            }
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver must be gone before the hub checks for an idle channel.
        drop(self.stream.take());
        message_hub::release(&self.hub, &self.user);
    }
}
