use rusqlite::{Connection, Row, params};

use mingle_types::error::ChatResult;

use crate::models::{GroupMessageRow, GroupPreviewRow, GroupRow, MemberRow, MessageRow};
use crate::{Database, store_err};

/// Maps a status string to its rank so forward-only checks can run inside
/// a single UPDATE. Must agree with `DeliveryStatus` ordering.
const STATUS_RANK: &str = "CASE status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END";

impl Database {
    // -- Direct messages --

    pub fn insert_message(&self, row: &MessageRow) -> ChatResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, content, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.id, row.sender_id, row.receiver_id, row.content, row.status, row.created_at],
            )
            .map_err(store_err)?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> ChatResult<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, sender_id, receiver_id, content, status, created_at
                     FROM messages WHERE id = ?1",
                )
                .map_err(store_err)?;
            let row = stmt
                .query_row([id], map_message)
                .optional()
                .map_err(store_err)?;
            Ok(row)
        })
    }

    /// Both directions of one conversation, oldest first. Ties on
    /// `created_at` break by id so the order is total.
    pub fn direct_messages(&self, user_a: &str, user_b: &str) -> ChatResult<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, sender_id, receiver_id, content, status, created_at
                     FROM messages
                     WHERE (sender_id = ?1 AND receiver_id = ?2)
                        OR (sender_id = ?2 AND receiver_id = ?1)
                     ORDER BY created_at ASC, id ASC",
                )
                .map_err(store_err)?;
            collect_messages(&mut stmt, params![user_a, user_b])
        })
    }

    /// All messages the user sent or received, newest first. `limit = None`
    /// returns the full history (SQLite treats LIMIT -1 as unbounded).
    pub fn messages_touching(&self, user_id: &str, limit: Option<u32>) -> ChatResult<Vec<MessageRow>> {
        let limit = limit.map(i64::from).unwrap_or(-1);
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, sender_id, receiver_id, content, status, created_at
                     FROM messages
                     WHERE sender_id = ?1 OR receiver_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2",
                )
                .map_err(store_err)?;
            collect_messages(&mut stmt, params![user_id, limit])
        })
    }

    /// Single-message forward transition, enforced in the statement itself:
    /// the row only changes when its current rank is below `target_rank`.
    /// Returns the updated row, or `None` when the id is unknown; an
    /// untouched (already at/past target) row comes back unchanged.
    pub fn advance_message_status(
        &self,
        id: &str,
        target: &str,
        target_rank: i64,
    ) -> ChatResult<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "UPDATE messages SET status = ?2 WHERE id = ?1 AND {STATUS_RANK} < ?3"
                ),
                params![id, target, target_rank],
            )
            .map_err(store_err)?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, sender_id, receiver_id, content, status, created_at
                     FROM messages WHERE id = ?1",
                )
                .map_err(store_err)?;
            let row = stmt
                .query_row([id], map_message)
                .optional()
                .map_err(store_err)?;
            Ok(row)
        })
    }

    /// Bulk sent -> delivered for everything `sender` has pending toward
    /// `receiver`. One statement, so repetition is a no-op. Returns the
    /// rows that actually transitioned.
    pub fn mark_direct_delivered(&self, receiver: &str, sender: &str) -> ChatResult<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "UPDATE messages SET status = 'delivered'
                     WHERE receiver_id = ?1 AND sender_id = ?2 AND status = 'sent'
                     RETURNING id, sender_id, receiver_id, content, status, created_at",
                )
                .map_err(store_err)?;
            collect_messages(&mut stmt, params![receiver, sender])
        })
    }

    /// Bulk sent/delivered -> seen for the whole visible history of one
    /// conversation, in a single atomic statement.
    pub fn mark_direct_seen(&self, receiver: &str, sender: &str) -> ChatResult<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "UPDATE messages SET status = 'seen'
                     WHERE receiver_id = ?1 AND sender_id = ?2
                       AND status IN ('sent', 'delivered')
                     RETURNING id, sender_id, receiver_id, content, status, created_at",
                )
                .map_err(store_err)?;
            collect_messages(&mut stmt, params![receiver, sender])
        })
    }

    // -- Groups --

    pub fn insert_group(&self, row: &GroupRow) -> ChatResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_chats (id, name, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row.id, row.name, row.created_by, row.created_at],
            )
            .map_err(store_err)?;
            Ok(())
        })
    }

    /// Create a group and its creator's membership row in one transaction,
    /// so a freshly created group is never observable without its creator.
    pub fn insert_group_with_creator(&self, group: &GroupRow, creator: &MemberRow) -> ChatResult<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(store_err)?;
            tx.execute(
                "INSERT INTO group_chats (id, name, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group.id, group.name, group.created_by, group.created_at],
            )
            .map_err(store_err)?;
            tx.execute(
                "INSERT INTO group_members (group_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![creator.group_id, creator.user_id, creator.joined_at],
            )
            .map_err(store_err)?;
            tx.commit().map_err(store_err)?;
            Ok(())
        })
    }

    pub fn get_group(&self, id: &str) -> ChatResult<Option<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, created_by, created_at FROM group_chats WHERE id = ?1")
                .map_err(store_err)?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(GroupRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_by: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })
                .optional()
                .map_err(store_err)?;
            Ok(row)
        })
    }

    /// Group directory: every group with its member count, whether
    /// `user_id` belongs to it, and the latest message preview. Newest
    /// groups first.
    pub fn list_groups(&self, user_id: &str) -> ChatResult<Vec<GroupPreviewRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT g.id, g.name, g.created_at,
                        (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id),
                        EXISTS(SELECT 1 FROM group_members m
                               WHERE m.group_id = g.id AND m.user_id = ?1),
                        (SELECT gm.content FROM group_messages gm
                         WHERE gm.group_id = g.id
                         ORDER BY gm.created_at DESC, gm.id DESC LIMIT 1),
                        (SELECT gm.created_at FROM group_messages gm
                         WHERE gm.group_id = g.id
                         ORDER BY gm.created_at DESC, gm.id DESC LIMIT 1)
                     FROM group_chats g
                     ORDER BY g.created_at DESC, g.id DESC",
                )
                .map_err(store_err)?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(GroupPreviewRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                        member_count: row.get(3)?,
                        is_member: row.get(4)?,
                        last_message: row.get(5)?,
                        last_message_at: row.get(6)?,
                    })
                })
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;
            Ok(rows)
        })
    }

    // -- Membership ledger --

    /// Idempotent join: the (group_id, user_id) primary key absorbs
    /// duplicate rows, including concurrent double-joins. Returns whether a
    /// row was actually created.
    pub fn insert_member(&self, row: &MemberRow) -> ChatResult<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    params![row.group_id, row.user_id, row.joined_at],
                )
                .map_err(store_err)?;
            Ok(changed > 0)
        })
    }

    pub fn is_member(&self, group_id: &str, user_id: &str) -> ChatResult<bool> {
        self.with_conn(|conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM group_members
                     WHERE group_id = ?1 AND user_id = ?2)",
                    params![group_id, user_id],
                    |row| row.get(0),
                )
                .map_err(store_err)?;
            Ok(exists)
        })
    }

    pub fn member_count(&self, group_id: &str) -> ChatResult<u32> {
        self.with_conn(|conn| {
            let count: u32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM group_members WHERE group_id = ?1",
                    [group_id],
                    |row| row.get(0),
                )
                .map_err(store_err)?;
            Ok(count)
        })
    }

    pub fn list_members(&self, group_id: &str) -> ChatResult<Vec<MemberRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT group_id, user_id, joined_at FROM group_members
                     WHERE group_id = ?1
                     ORDER BY joined_at ASC, user_id ASC",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map([group_id], |row| {
                    Ok(MemberRow {
                        group_id: row.get(0)?,
                        user_id: row.get(1)?,
                        joined_at: row.get(2)?,
                    })
                })
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;
            Ok(rows)
        })
    }

    // -- Group messages --

    pub fn insert_group_message(&self, row: &GroupMessageRow) -> ChatResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_messages (id, group_id, user_id, content, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.id, row.group_id, row.user_id, row.content, row.status, row.created_at],
            )
            .map_err(store_err)?;
            Ok(())
        })
    }

    pub fn get_group_message(&self, id: &str) -> ChatResult<Option<GroupMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, group_id, user_id, content, status, created_at
                     FROM group_messages WHERE id = ?1",
                )
                .map_err(store_err)?;
            let row = stmt
                .query_row([id], map_group_message)
                .optional()
                .map_err(store_err)?;
            Ok(row)
        })
    }

    pub fn group_messages(&self, group_id: &str) -> ChatResult<Vec<GroupMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, group_id, user_id, content, status, created_at
                     FROM group_messages
                     WHERE group_id = ?1
                     ORDER BY created_at ASC, id ASC",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map([group_id], map_group_message)
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;
            Ok(rows)
        })
    }

    /// Forward transition for one group message, same statement-level rank
    /// check as the direct variant.
    pub fn advance_group_message_status(
        &self,
        id: &str,
        target: &str,
        target_rank: i64,
    ) -> ChatResult<Option<GroupMessageRow>> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "UPDATE group_messages SET status = ?2 WHERE id = ?1 AND {STATUS_RANK} < ?3"
                ),
                params![id, target, target_rank],
            )
            .map_err(store_err)?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, group_id, user_id, content, status, created_at
                     FROM group_messages WHERE id = ?1",
                )
                .map_err(store_err)?;
            let row = stmt
                .query_row([id], map_group_message)
                .optional()
                .map_err(store_err)?;
            Ok(row)
        })
    }

    /// Bulk sent -> delivered for group messages not authored by `user_id`.
    pub fn mark_group_delivered(&self, group_id: &str, user_id: &str) -> ChatResult<Vec<GroupMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "UPDATE group_messages SET status = 'delivered'
                     WHERE group_id = ?1 AND user_id != ?2 AND status = 'sent'
                     RETURNING id, group_id, user_id, content, status, created_at",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![group_id, user_id], map_group_message)
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;
            Ok(rows)
        })
    }

    /// Everything in the group not authored by `user_id` becomes seen.
    pub fn mark_group_seen(&self, group_id: &str, user_id: &str) -> ChatResult<Vec<GroupMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "UPDATE group_messages SET status = 'seen'
                     WHERE group_id = ?1 AND user_id != ?2
                       AND status IN ('sent', 'delivered')
                     RETURNING id, group_id, user_id, content, status, created_at",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![group_id, user_id], map_group_message)
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;
            Ok(rows)
        })
    }
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_group_message(row: &Row<'_>) -> rusqlite::Result<GroupMessageRow> {
    Ok(GroupMessageRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn collect_messages(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[&dyn rusqlite::types::ToSql],
) -> ChatResult<Vec<MessageRow>> {
    let rows = stmt
        .query_map(params, map_message)
        .map_err(store_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(store_err)?;
    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn msg(id: &str, sender: &str, receiver: &str, at: &str) -> MessageRow {
        MessageRow {
            id: id.into(),
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            content: format!("msg {id}"),
            status: "sent".into(),
            created_at: at.into(),
        }
    }

    #[test]
    fn direct_messages_are_symmetric_and_totally_ordered() {
        let db = db();
        // Two messages share a timestamp; ids break the tie.
        db.insert_message(&msg("b", "alice", "bob", "2026-01-01T10:00:00.000000Z")).unwrap();
        db.insert_message(&msg("a", "bob", "alice", "2026-01-01T10:00:00.000000Z")).unwrap();
        db.insert_message(&msg("c", "alice", "bob", "2026-01-01T09:00:00.000000Z")).unwrap();

        let ab: Vec<String> = db
            .direct_messages("alice", "bob")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        let ba: Vec<String> = db
            .direct_messages("bob", "alice")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();

        assert_eq!(ab, vec!["c", "a", "b"]);
        assert_eq!(ab, ba);
    }

    #[test]
    fn bulk_seen_is_idempotent() {
        let db = db();
        db.insert_message(&msg("1", "alice", "bob", "2026-01-01T10:00:00.000000Z")).unwrap();
        db.insert_message(&msg("2", "alice", "bob", "2026-01-01T10:00:01.000000Z")).unwrap();

        let first = db.mark_direct_seen("bob", "alice").unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|r| r.status == "seen"));

        let second = db.mark_direct_seen("bob", "alice").unwrap();
        assert!(second.is_empty());

        let all = db.direct_messages("alice", "bob").unwrap();
        assert!(all.iter().all(|r| r.status == "seen"));
    }

    #[test]
    fn delivered_only_touches_sent_rows() {
        let db = db();
        db.insert_message(&msg("1", "alice", "bob", "2026-01-01T10:00:00.000000Z")).unwrap();
        db.mark_direct_seen("bob", "alice").unwrap();
        db.insert_message(&msg("2", "alice", "bob", "2026-01-01T10:00:01.000000Z")).unwrap();

        let delivered = db.mark_direct_delivered("bob", "alice").unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, "2");

        // The seen row never regressed.
        let all = db.direct_messages("alice", "bob").unwrap();
        assert_eq!(all[0].status, "seen");
        assert_eq!(all[1].status, "delivered");
    }

    #[test]
    fn advance_skips_backward_transitions() {
        let db = db();
        db.insert_message(&msg("1", "alice", "bob", "2026-01-01T10:00:00.000000Z")).unwrap();

        let row = db.advance_message_status("1", "seen", 2).unwrap().unwrap();
        assert_eq!(row.status, "seen");

        // Lower-ranked target leaves the row alone.
        let row = db.advance_message_status("1", "delivered", 1).unwrap().unwrap();
        assert_eq!(row.status, "seen");

        assert!(db.advance_message_status("nope", "seen", 2).unwrap().is_none());
    }

    #[test]
    fn membership_is_unique_per_user_and_group() {
        let db = db();
        db.insert_group(&GroupRow {
            id: "g1".into(),
            name: "hikers".into(),
            created_by: "alice".into(),
            created_at: "2026-01-01T09:00:00.000000Z".into(),
        })
        .unwrap();

        let member = MemberRow {
            group_id: "g1".into(),
            user_id: "bob".into(),
            joined_at: "2026-01-01T10:00:00.000000Z".into(),
        };
        assert!(db.insert_member(&member).unwrap());
        assert!(!db.insert_member(&member).unwrap());

        assert!(db.is_member("g1", "bob").unwrap());
        assert!(!db.is_member("g1", "carol").unwrap());
        assert_eq!(db.member_count("g1").unwrap(), 1);
        assert_eq!(db.list_members("g1").unwrap().len(), 1);
    }

    #[test]
    fn group_directory_previews() {
        let db = db();
        db.insert_group(&GroupRow {
            id: "g1".into(),
            name: "hikers".into(),
            created_by: "alice".into(),
            created_at: "2026-01-01T09:00:00.000000Z".into(),
        })
        .unwrap();
        db.insert_group(&GroupRow {
            id: "g2".into(),
            name: "readers".into(),
            created_by: "bob".into(),
            created_at: "2026-01-02T09:00:00.000000Z".into(),
        })
        .unwrap();
        db.insert_member(&MemberRow {
            group_id: "g1".into(),
            user_id: "alice".into(),
            joined_at: "2026-01-01T09:00:00.000000Z".into(),
        })
        .unwrap();
        db.insert_group_message(&GroupMessageRow {
            id: "m1".into(),
            group_id: "g1".into(),
            user_id: "alice".into(),
            content: "trail at 9".into(),
            status: "sent".into(),
            created_at: "2026-01-03T08:00:00.000000Z".into(),
        })
        .unwrap();

        let previews = db.list_groups("alice").unwrap();
        assert_eq!(previews.len(), 2);
        // Newest group first.
        assert_eq!(previews[0].id, "g2");
        assert_eq!(previews[0].member_count, 0);
        assert!(!previews[0].is_member);
        assert!(previews[0].last_message.is_none());

        assert_eq!(previews[1].id, "g1");
        assert_eq!(previews[1].member_count, 1);
        assert!(previews[1].is_member);
        assert_eq!(previews[1].last_message.as_deref(), Some("trail at 9"));
    }

    #[test]
    fn group_seen_excludes_author() {
        let db = db();
        db.insert_group(&GroupRow {
            id: "g1".into(),
            name: "hikers".into(),
            created_by: "alice".into(),
            created_at: "2026-01-01T09:00:00.000000Z".into(),
        })
        .unwrap();
        db.insert_group_message(&GroupMessageRow {
            id: "m1".into(),
            group_id: "g1".into(),
            user_id: "alice".into(),
            content: "mine".into(),
            status: "sent".into(),
            created_at: "2026-01-01T10:00:00.000000Z".into(),
        })
        .unwrap();
        db.insert_group_message(&GroupMessageRow {
            id: "m2".into(),
            group_id: "g1".into(),
            user_id: "bob".into(),
            content: "theirs".into(),
            status: "sent".into(),
            created_at: "2026-01-01T10:00:01.000000Z".into(),
        })
        .unwrap();

        let seen = db.mark_group_seen("g1", "alice").unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, "m2");

        let all = db.group_messages("g1").unwrap();
        assert_eq!(all[0].status, "sent");
        assert_eq!(all[1].status, "seen");
    }
}
