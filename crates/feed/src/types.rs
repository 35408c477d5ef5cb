//! Core types for the feed crate.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a will (bequest record).
///
/// The backing store assigns these; the feed treats them as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BequestId(String);

impl BequestId {
    /// Create a new random ID.
    pub fn new() -> Self {
        Self(Ulid::new().to_string().to_lowercase())
    }

    /// Wrap an existing identifier.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BequestId {
    fn from(id: &str) -> Self {
        Self::from_string(id)
    }
}

impl From<String> for BequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier for a user profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an existing identifier.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::from_string(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Whether the recipient has answered a will.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BequestStatus {
    #[default]
    Pending,
    Accepted,
    Declined,
}

/// One declared item-to-recipient assignment.
///
/// The feed only looks at `id`, `is_public` and `created_at`; the rest is
/// carried through untouched for rendering. `item_description` is required so
/// a replication slice (`id`, `is_public`, `created_at`) never passes for a
/// complete row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BequestRecord {
    pub id: BequestId,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub giver_id: Option<UserId>,
    #[serde(default)]
    pub recipient_id: Option<UserId>,
    #[serde(default)]
    pub recipient_email: Option<String>,
    pub item_description: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub status: BequestStatus,
}

impl BequestRecord {
    /// Create a public record stamped with the current time.
    pub fn new(item_description: impl Into<String>) -> Self {
        Self {
            id: BequestId::new(),
            is_public: true,
            created_at: Utc::now(),
            giver_id: None,
            recipient_id: None,
            recipient_email: None,
            item_description: item_description.into(),
            emoji: None,
            image_url: None,
            tag: None,
            status: BequestStatus::Pending,
        }
    }

    /// Set the identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<BequestId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the creation timestamp.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Set the visibility flag.
    #[must_use]
    pub fn with_public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    /// Set the giver.
    #[must_use]
    pub fn with_giver(mut self, giver: impl Into<UserId>) -> Self {
        self.giver_id = Some(giver.into());
        self
    }

    /// Set the emoji.
    #[must_use]
    pub fn with_emoji(mut self, emoji: impl Into<String>) -> Self {
        self.emoji = Some(emoji.into());
        self
    }

    /// Set the tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Newest first; equal timestamps fall back to descending id so the order is total.
pub fn feed_order(a: &BequestRecord, b: &BequestRecord) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Why a notification was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    WillReceived,
    WillAccepted,
    WillDeclined,
    Reaction,
    FuneralInvite,
}

/// A notification row addressed to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub actor_id: UserId,
    #[serde(default)]
    pub will_id: Option<BequestId>,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Create an unread notification for `user_id`.
    pub fn new(user_id: impl Into<UserId>, actor_id: impl Into<UserId>, kind: NotificationKind) -> Self {
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            user_id: user_id.into(),
            kind,
            actor_id: actor_id.into(),
            will_id: None,
            emoji: None,
            read: false,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_bequest_ids_are_unique() {
        assert_ne!(BequestId::new(), BequestId::new());
    }

    #[test]
    fn test_feed_order_newest_first() {
        let old = BequestRecord::new("old").with_id("a").with_created_at(at(5));
        let new = BequestRecord::new("new").with_id("b").with_created_at(at(10));
        let mut records = vec![old.clone(), new.clone()];
        records.sort_by(feed_order);
        assert_eq!(records, vec![new, old]);
    }

    #[test]
    fn test_feed_order_breaks_ties_by_id() {
        let a = BequestRecord::new("a").with_id("a").with_created_at(at(7));
        let b = BequestRecord::new("b").with_id("b").with_created_at(at(7));
        assert_eq!(feed_order(&a, &b), Ordering::Greater);
        assert_eq!(feed_order(&b, &a), Ordering::Less);
    }

    #[test]
    fn test_record_deserializes_from_row_shape() {
        let row = serde_json::json!({
            "id": "3f1c",
            "is_public": true,
            "created_at": "2024-03-01T12:00:00Z",
            "giver_id": "u1",
            "item_description": "my vinyl collection",
            "emoji": "💀",
            "status": "accepted",
            "giver": { "username": "ignored" }
        });
        let record: BequestRecord = serde_json::from_value(row).unwrap();
        assert_eq!(record.id.as_str(), "3f1c");
        assert_eq!(record.status, BequestStatus::Accepted);
        assert_eq!(record.recipient_id, None);
    }

    #[test]
    fn test_notification_kind_uses_row_column_name() {
        let row = serde_json::json!({
            "id": "n1",
            "user_id": "u1",
            "type": "funeral_invite",
            "actor_id": "u2",
            "created_at": "2024-03-01T12:00:00Z"
        });
        let notification: NotificationRecord = serde_json::from_value(row).unwrap();
        assert_eq!(notification.kind, NotificationKind::FuneralInvite);
        assert!(!notification.read);
    }
}
