//! Real-time message fan-out via tokio broadcast channels.
//! One broadcast channel per user id; capacity 64 messages.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::store::MessageRecord;
use crate::unread::UserId;

const CHANNEL_CAPACITY: usize = 64;

/// Broadcast channel map: user_id -> Sender<MessageRecord>.
pub type MessageHub = Arc<DashMap<UserId, broadcast::Sender<MessageRecord>>>;

/// Create a new empty MessageHub.
pub fn new_hub() -> MessageHub {
    Arc::new(DashMap::new())
}

/// Deliver a new message to both participants' channels.
/// Users without live subscribers are skipped and their channel is pruned.
pub fn publish(hub: &MessageHub, message: &MessageRecord) {
    send_to(hub, &message.receiver_id, message);
    if message.sender_id != message.receiver_id {
        send_to(hub, &message.sender_id, message);
    }
}

fn send_to(hub: &MessageHub, user_id: &UserId, message: &MessageRecord) {
    let delivered = match hub.get(user_id) {
        Some(tx) => tx.send(message.clone()).is_ok(),
        None => return,
    };
    if !delivered {
        // Every receiver is gone.
        release(hub, user_id);
    }
}

/// Subscribe to new messages involving the given user.
/// Creates the broadcast channel if it doesn't exist yet.
pub fn subscribe(hub: &MessageHub, user_id: &UserId) -> broadcast::Receiver<MessageRecord> {
    hub.entry(user_id.clone())
        .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
        .subscribe()
}

/// Drop `user_id`'s channel once its last receiver is gone.
pub fn release(hub: &MessageHub, user_id: &UserId) {
    if hub
        .remove_if(user_id, |_, tx| tx.receiver_count() == 0)
        .is_some()
    {
        trace!(user_id = %user_id, "released idle message channel");
    }
}

/// Number of live receivers for a user (0 if no channel exists).
pub fn subscriber_count(hub: &MessageHub, user_id: &UserId) -> usize {
    hub.get(user_id).map(|tx| tx.receiver_count()).unwrap_or(0)
}
