//! Feeds newly inserted messages into the hub.
//! The `messages` insert trigger announces each row's ids on `message_inserted`;
//! the row itself is loaded before publishing.

use serde::Deserialize;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::message_service::MessageService;
use crate::message_hub::{self, MessageHub};
use crate::store::MessageRecord;

pub const CHANNEL: &str = "message_inserted";

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Notification payload sent by the insert trigger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageInserted {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
}

pub fn parse_payload(payload: &str) -> Result<MessageInserted, serde_json::Error> {
    serde_json::from_str(payload)
}

/// Start listening and spawn the forwarding loop. Runs until aborted.
pub async fn spawn(pool: &PgPool, hub: MessageHub) -> Result<JoinHandle<()>, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANNEL).await?;
    info!(channel = CHANNEL, "listening for new messages");

    let messages = MessageService::new(pool.clone());
    Ok(tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(notification) => match parse_payload(notification.payload()) {
                    Ok(inserted) => forward(&messages, &hub, inserted).await,
                    Err(error) => warn!(%error, "skipping malformed message notification"),
                },
                Err(error) => {
                    warn!(%error, "message listener error, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }))
}

async fn forward(messages: &MessageService, hub: &MessageHub, inserted: MessageInserted) {
    match messages.get_message(inserted.id).await {
        Ok(Some(row)) => {
            trace!(message_id = %row.id, "new message");
            message_hub::publish(hub, &MessageRecord::from(row));
        }
        Ok(None) => debug!(message_id = %inserted.id, "announced message no longer exists"),
        Err(error) => warn!(message_id = %inserted.id, %error, "failed to load new message"),
    }
}
