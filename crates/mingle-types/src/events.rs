use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Group, GroupMember, GroupMessage, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Message,
    GroupMessage,
    Group,
    Membership,
}

/// The entity carried by a change event. Insert events carry the freshly
/// persisted row; update events carry the row after the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entity", content = "payload", rename_all = "snake_case")]
pub enum ChangePayload {
    Message(Message),
    GroupMessage(GroupMessage),
    Group(Group),
    Membership(GroupMember),
}

/// A single insert/update notification from the live change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: Operation,
    #[serde(flatten)]
    pub payload: ChangePayload,
}

/// Who an event is relevant to. Direct scopes are normalized so that the
/// same user pair always yields the same scope regardless of direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeScope {
    Direct { a: Uuid, b: Uuid },
    Group(Uuid),
    /// Group directory changes (new groups, membership rows) — relevant to
    /// anyone browsing the group list.
    Directory,
}

impl ChangeScope {
    pub fn direct(x: Uuid, y: Uuid) -> Self {
        if x <= y {
            Self::Direct { a: x, b: y }
        } else {
            Self::Direct { a: y, b: x }
        }
    }
}

impl ChangeEvent {
    pub fn insert(payload: ChangePayload) -> Self {
        Self { op: Operation::Insert, payload }
    }

    pub fn update(payload: ChangePayload) -> Self {
        Self { op: Operation::Update, payload }
    }

    pub fn kind(&self) -> EntityKind {
        match &self.payload {
            ChangePayload::Message(_) => EntityKind::Message,
            ChangePayload::GroupMessage(_) => EntityKind::GroupMessage,
            ChangePayload::Group(_) => EntityKind::Group,
            ChangePayload::Membership(_) => EntityKind::Membership,
        }
    }

    pub fn scope(&self) -> ChangeScope {
        match &self.payload {
            ChangePayload::Message(m) => ChangeScope::direct(m.sender_id, m.receiver_id),
            ChangePayload::GroupMessage(m) => ChangeScope::Group(m.group_id),
            ChangePayload::Group(_) | ChangePayload::Membership(_) => ChangeScope::Directory,
        }
    }
}

/// Commands sent FROM client TO server over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection with a bearer token.
    Identify { token: String },

    /// Replace this connection's event scopes. `counterparts` are user ids
    /// for direct chats, `groups` are group ids; `directory` opts into
    /// group-directory changes (new groups, joins).
    Subscribe {
        #[serde(default)]
        counterparts: Vec<Uuid>,
        #[serde(default)]
        groups: Vec<Uuid>,
        #[serde(default)]
        directory: bool,
    },
}

/// Frames sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayFrame {
    /// Server confirms successful authentication.
    Ready { user_id: Uuid, username: String },

    /// A change event matching this connection's subscriptions.
    Change(ChangeEvent),

    /// The connection fell behind and `skipped` events were dropped.
    /// The client must re-fetch state to resynchronize.
    Lagged { skipped: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::DeliveryStatus;

    #[test]
    fn direct_scope_is_symmetric() {
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        assert_eq!(ChangeScope::direct(x, y), ChangeScope::direct(y, x));
    }

    #[test]
    fn message_event_wire_shape() {
        let msg = Message {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            content: "hi".into(),
            created_at: Utc::now(),
            status: DeliveryStatus::Sent,
        };
        let event = ChangeEvent::insert(ChangePayload::Message(msg));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["op"], "insert");
        assert_eq!(json["entity"], "message");
        assert_eq!(json["payload"]["status"], "sent");
    }
}
