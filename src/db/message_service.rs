use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::store::MessageRecord;

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for MessageRecord {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            sender_id: row.sender_id.into(),
            receiver_id: row.receiver_id.into(),
            content: row.content,
            read: row.read,
            created_at: row.created_at,
        }
    }
}

pub struct MessageService {
    pool: PgPool,
}

impl MessageService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new unread message. The insert trigger announces it on `message_inserted`.
    pub async fn insert_message(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
    ) -> Result<MessageRow, sqlx::Error> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (sender_id, receiver_id, content)
            VALUES ($1, $2, $3)
            RETURNING id, sender_id, receiver_id, content, read, created_at
            "#,
        )
        .bind(sender_id)
        .bind(receiver_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_message(&self, id: Uuid) -> Result<Option<MessageRow>, sqlx::Error> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, sender_id, receiver_id, content, read, created_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Every message between the two users, oldest first.
    pub async fn list_conversation(
        &self,
        user_id: Uuid,
        correspondent_id: Uuid,
    ) -> Result<Vec<MessageRow>, sqlx::Error> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, sender_id, receiver_id, content, read, created_at
            FROM messages
            WHERE (sender_id = $1 AND receiver_id = $2)
               OR (sender_id = $2 AND receiver_id = $1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .bind(correspondent_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Count unread messages addressed to the user, from anyone.
    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64, sqlx::Error> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM messages WHERE receiver_id = $1 AND read = false",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Mark every unread message from `correspondent_id` to `user_id` as read.
    /// Returns the number of messages updated.
    pub async fn mark_conversation_read(
        &self,
        user_id: Uuid,
        correspondent_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET read = true
            WHERE receiver_id = $1 AND sender_id = $2 AND read = false
            "#,
        )
        .bind(user_id)
        .bind(correspondent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
