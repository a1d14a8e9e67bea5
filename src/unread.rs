//! Unread counters and the transient toast. Pure state; the tracker task owns one
//! `UnreadState` and applies every transition through the methods here so the
//! sum invariant is kept in one place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque user identifier as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// A friend the viewer exchanges messages with. Only ever used as a map key.
pub type CorrespondentId = UserId;

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Auto-expiring notification raised by an incoming message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Toast {
    pub id: Uuid,
    pub correspondent_name: String,
    pub message_content: String,
}

impl Toast {
    pub fn new(correspondent_name: impl Into<String>, message_content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            correspondent_name: correspondent_name.into(),
            message_content: message_content.into(),
        }
    }
}

/// Unread counts for one viewer.
///
/// Invariants held after every method returns:
/// - `total_unread` equals the sum of `unread_by_correspondent` values
/// - no correspondent maps to 0
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadState {
    total_unread: u64,
    unread_by_correspondent: BTreeMap<CorrespondentId, u64>,
    pending_toast: Option<Toast>,
}

impl UnreadState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build counters from raw per-correspondent counts; zero counts are dropped.
    pub fn from_counts<I>(counts: I) -> Self
    where
        I: IntoIterator<Item = (CorrespondentId, u64)>,
    {
        let mut state = Self::empty();
        state.replace_counts(counts);
        state
    }

    pub fn total_unread(&self) -> u64 {
        self.total_unread
    }

    pub fn unread_by_correspondent(&self) -> &BTreeMap<CorrespondentId, u64> {
        &self.unread_by_correspondent
    }

    pub fn unread_for(&self, correspondent: &CorrespondentId) -> u64 {
        self.unread_by_correspondent
            .get(correspondent)
            .copied()
            .unwrap_or(0)
    }

    pub fn pending_toast(&self) -> Option<&Toast> {
        self.pending_toast.as_ref()
    }

    /// Replace both counters in one step. The pending toast is left alone.
    pub fn replace_counts<I>(&mut self, counts: I)
    where
        I: IntoIterator<Item = (CorrespondentId, u64)>,
    {
        let mut map = BTreeMap::new();
        for (correspondent, count) in counts {
            if count > 0 {
                *map.entry(correspondent).or_insert(0) += count;
            }
        }
        self.total_unread = map.values().sum();
        self.unread_by_correspondent = map;
    }

    /// Count one new unread message from `sender` and surface `toast`.
    pub fn record_incoming(&mut self, sender: CorrespondentId, toast: Toast) {
        *self.unread_by_correspondent.entry(sender).or_insert(0) += 1;
        self.total_unread += 1;
        self.pending_toast = Some(toast);
    }

    /// Drop the counter for `correspondent`. Returns the count that was removed.
    pub fn clear_correspondent(&mut self, correspondent: &CorrespondentId) -> u64 {
        let cleared = self
            .unread_by_correspondent
            .remove(correspondent)
            .unwrap_or(0);
        self.total_unread = self.total_unread.saturating_sub(cleared);
        cleared
    }

    pub fn dismiss_toast(&mut self) {
        self.pending_toast = None;
    }

    /// Clear the toast only if it is still the one identified by `toast_id`.
    /// Returns true when the toast was cleared.
    pub fn expire_toast(&mut self, toast_id: Uuid) -> bool {
        match &self.pending_toast {
            Some(toast) if toast.id == toast_id => {
                self.pending_toast = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.unread_by_correspondent.values().all(|&count| count > 0)
            && self.total_unread == self.unread_by_correspondent.values().sum::<u64>()
    }
}
