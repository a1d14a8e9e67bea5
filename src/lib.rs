//! Unread-message notifications for the fitlog messaging feature.
//!
//! The core is [`tracker::NotificationTracker`]: one task per connected client that
//! keeps per-friend unread counts in sync with the message store and its live feed.
//! Everything else is the shell around it (PostgreSQL store, LISTEN/NOTIFY feed,
//! per-user broadcast hub, HTTP/WebSocket surface).

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod message_hub;
pub mod store;
pub mod tracker;
pub mod unread;

pub use error::{StoreError, TrackerError};
pub use store::{FriendRecord, MessageRecord, MessageStore, Subscription};
pub use tracker::{NotificationTracker, TrackerHandle};
pub use unread::{CorrespondentId, Toast, UnreadState, UserId};
