use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name used when a counterpart's profile cannot be resolved.
pub const UNKNOWN_USER: &str = "Unknown User";

/// Per-message delivery state. Advances forward only:
/// sent -> delivered -> seen. Declaration order defines the ranking,
/// so the derived `Ord` is the transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Seen,
}

impl DeliveryStatus {
    /// Stable string form, also used as the SQLite column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Seen => "seen",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "seen" => Some(Self::Seen),
            _ => None,
        }
    }

    /// True when moving to `target` would be a forward transition.
    pub fn can_advance_to(&self, target: DeliveryStatus) -> bool {
        target > *self
    }
}

/// A message between exactly two users. Immutable except for `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

/// A message scoped to a group; visibility gated by membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessage {
    pub id: Uuid,
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

/// One membership row. Unique per (group_id, user_id); never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

/// Identity record resolved through the external profile directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
}

/// Derived inbox entry for one direct-chat counterpart. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPreview {
    pub counterpart_id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: u32,
}

/// Derived directory entry for one group. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPreview {
    pub group_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub member_count: u32,
    pub is_member: bool,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_order_is_transition_order() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Seen);
        assert!(DeliveryStatus::Sent.can_advance_to(DeliveryStatus::Seen));
        assert!(!DeliveryStatus::Seen.can_advance_to(DeliveryStatus::Delivered));
        assert!(!DeliveryStatus::Delivered.can_advance_to(DeliveryStatus::Delivered));
    }

    #[test]
    fn status_string_form_round_trips() {
        for status in [
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Seen,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("read"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&DeliveryStatus::Delivered).unwrap();
        assert_eq!(json, "\"delivered\"");
    }
}
