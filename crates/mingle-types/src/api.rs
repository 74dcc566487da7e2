use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::DeliveryStatus;

// -- Identity --

/// Bearer-token claims issued by the external identity service. The core
/// only verifies them; it never issues tokens. Shared between mingle-api
/// (REST middleware) and mingle-gateway (WebSocket identify).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdvanceStatusRequest {
    pub target: DeliveryStatus,
}

/// Group message decorated with the author's display name.
#[derive(Debug, Clone, Serialize)]
pub struct GroupMessageResponse {
    pub id: Uuid,
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

// -- Groups --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberResponse {
    pub user_id: Uuid,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}
