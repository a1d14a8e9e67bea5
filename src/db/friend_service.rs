use sqlx::{FromRow, PgPool};
use uuid::Uuid;

pub const STATUS_ACCEPTED: &str = "accepted";

#[derive(Debug, Clone, FromRow)]
pub struct FriendRow {
    pub friend_id: Uuid,
    pub display_name: String,
}

pub struct FriendService {
    pool: PgPool,
}

impl FriendService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the profile or update its display name.
    pub async fn upsert_profile(&self, id: Uuid, display_name: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, display_name)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET display_name = EXCLUDED.display_name
            "#,
        )
        .bind(id)
        .bind(display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Accepted friends of the user with their display names, ordered by name.
    pub async fn list_friends(&self, user_id: Uuid) -> Result<Vec<FriendRow>, sqlx::Error> {
        sqlx::query_as::<_, FriendRow>(
            r#"
            SELECT f.friend_id, p.display_name
            FROM friendships f
            JOIN profiles p ON p.id = f.friend_id
            WHERE f.user_id = $1 AND f.status = $2
            ORDER BY p.display_name
            "#,
        )
        .bind(user_id)
        .bind(STATUS_ACCEPTED)
        .fetch_all(&self.pool)
        .await
    }

    /// Record an accepted friendship in both directions. Idempotent.
    pub async fn add_friendship(&self, a: Uuid, b: Uuid) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for (user_id, friend_id) in [(a, b), (b, a)] {
            sqlx::query(
                r#"
                INSERT INTO friendships (user_id, friend_id, status)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id, friend_id) DO UPDATE SET status = EXCLUDED.status
                "#,
            )
            .bind(user_id)
            .bind(friend_id)
            .bind(STATUS_ACCEPTED)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}
