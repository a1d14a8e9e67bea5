use async_trait::async_trait;
use sqlx::PgPool;

use super::friend_service::FriendService;
use super::message_service::MessageService;
use super::parse_user_id;
use crate::error::StoreError;
use crate::message_hub::MessageHub;
use crate::store::{FriendRecord, MessageRecord, MessageStore, Subscription};
use crate::unread::{CorrespondentId, UserId};

/// Message store backed by PostgreSQL. The live feed comes from the hub, which
/// the `message_inserted` listener fills.
pub struct PgMessageStore {
    messages: MessageService,
    friends: FriendService,
    hub: MessageHub,
}

impl PgMessageStore {
    pub fn new(pool: PgPool, hub: MessageHub) -> Self {
        Self {
            messages: MessageService::new(pool.clone()),
            friends: FriendService::new(pool),
            hub,
        }
    }

    pub fn messages(&self) -> &MessageService {
        &self.messages
    }

    pub fn friends(&self) -> &FriendService {
        &self.friends
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn get_unread_message_count(&self, user: &UserId) -> Result<u64, StoreError> {
        let count = self.messages.unread_count(parse_user_id(user)?).await?;
        Ok(count.max(0) as u64)
    }

    async fn get_friends(&self, user: &UserId) -> Result<Vec<FriendRecord>, StoreError> {
        let rows = self.friends.list_friends(parse_user_id(user)?).await?;
        Ok(rows
            .into_iter()
            .map(|row| FriendRecord {
                friend_id: row.friend_id.into(),
                display_name: row.display_name,
            })
            .collect())
    }

    async fn get_messages(
        &self,
        user: &UserId,
        correspondent: &CorrespondentId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = self
            .messages
            .list_conversation(parse_user_id(user)?, parse_user_id(correspondent)?)
            .await?;
        Ok(rows.into_iter().map(MessageRecord::from).collect())
    }

    async fn mark_messages_as_read(
        &self,
        user: &UserId,
        correspondent: &CorrespondentId,
    ) -> Result<(), StoreError> {
        self.messages
            .mark_conversation_read(parse_user_id(user)?, parse_user_id(correspondent)?)
            .await?;
        Ok(())
    }

    async fn subscribe_to_messages(&self, user: &UserId) -> Result<Subscription, StoreError> {
        parse_user_id(user)?;
        Ok(Subscription::open(&self.hub, user))
    }
}
