/// Database row types — these map directly to SQLite rows.
/// Distinct from the mingle-types API models to keep the DB layer
/// independent; timestamps stay in their stored RFC 3339 text form here.

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
}

pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub created_at: String,
}

pub struct MemberRow {
    pub group_id: String,
    pub user_id: String,
    pub joined_at: String,
}

pub struct GroupMessageRow {
    pub id: String,
    pub group_id: String,
    pub user_id: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
}

/// One group as shown in the group directory: the group row plus the
/// derived preview columns computed in SQL.
pub struct GroupPreviewRow {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub member_count: u32,
    pub is_member: bool,
    pub last_message: Option<String>,
    pub last_message_at: Option<String>,
}
