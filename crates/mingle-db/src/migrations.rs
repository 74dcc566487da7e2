use rusqlite::Connection;
use tracing::info;

use mingle_types::error::ChatResult;

use crate::store_err;

pub fn run(conn: &Connection) -> ChatResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            sender_id   TEXT NOT NULL,
            receiver_id TEXT NOT NULL,
            content     TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'sent'
                        CHECK (status IN ('sent', 'delivered', 'seen')),
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_receiver
            ON messages(receiver_id, status);

        CREATE TABLE IF NOT EXISTS group_chats (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            created_by  TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id    TEXT NOT NULL REFERENCES group_chats(id),
            user_id     TEXT NOT NULL,
            joined_at   TEXT NOT NULL,
            PRIMARY KEY (group_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS group_messages (
            id          TEXT PRIMARY KEY,
            group_id    TEXT NOT NULL REFERENCES group_chats(id),
            user_id     TEXT NOT NULL,
            content     TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'sent'
                        CHECK (status IN ('sent', 'delivered', 'seen')),
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_group_messages_group
            ON group_messages(group_id, created_at);
        ",
    )
    .map_err(store_err)?;

    info!("Database migrations complete");
    Ok(())
}
