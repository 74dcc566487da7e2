//! Conversation aggregation: the inbox view.
//!
//! Previews are derived on demand from the message history — nothing here
//! is persisted. The fold works on messages newest-first, so the first
//! message seen for a counterpart is that conversation's `last_message`,
//! and the preview list comes out ordered by recency.

use std::collections::HashMap;

use uuid::Uuid;

use mingle_types::error::ChatResult;
use mingle_types::models::{ConversationPreview, DeliveryStatus, GroupPreview, Message, UNKNOWN_USER};

use crate::ChatService;
use crate::service::{message_from_row, parse_timestamp, parse_uuid};

struct PreviewAccum {
    last: Message,
    unread: u32,
}

impl ChatService {
    /// Build the direct-chat inbox for `user`: one preview per
    /// counterpart, ordered by most recent message. `limit` bounds the
    /// message window (the dashboard widget uses 5); `None` folds the full
    /// history. Unread counts within a bounded window count only messages
    /// inside it.
    pub async fn inbox(&self, user: Uuid, limit: Option<u32>) -> ChatResult<Vec<ConversationPreview>> {
        let user_s = user.to_string();
        let rows = self
            .with_db(move |db| db.messages_touching(&user_s, limit))
            .await?;

        // Newest-first fold: first sighting of a counterpart wins the
        // last-message slot; ties on created_at were already broken by id
        // in the query, so the result is stable for identical input.
        let mut order: Vec<Uuid> = Vec::new();
        let mut previews: HashMap<Uuid, PreviewAccum> = HashMap::new();
        for row in rows {
            let message = message_from_row(row);
            let counterpart = if message.sender_id == user {
                message.receiver_id
            } else {
                message.sender_id
            };
            let unread = u32::from(message.receiver_id == user && message.status != DeliveryStatus::Seen);

            match previews.get_mut(&counterpart) {
                Some(accum) => accum.unread += unread,
                None => {
                    order.push(counterpart);
                    previews.insert(counterpart, PreviewAccum { last: message, unread });
                }
            }
        }

        // Resolve display identities; a missing or failing profile becomes
        // the sentinel rather than aborting the whole inbox.
        let mut result = Vec::with_capacity(order.len());
        for counterpart in order {
            let Some(accum) = previews.remove(&counterpart) else {
                continue;
            };
            let (username, avatar_url) = match self.profiles().get_profile(counterpart).await {
                Ok(Some(profile)) => (profile.username, profile.avatar_url),
                Ok(None) => (UNKNOWN_USER.to_string(), None),
                Err(e) => {
                    tracing::warn!("Profile lookup for {} failed: {}", counterpart, e);
                    (UNKNOWN_USER.to_string(), None)
                }
            };
            result.push(ConversationPreview {
                counterpart_id: counterpart,
                username,
                avatar_url,
                last_message: accum.last.content,
                last_message_at: accum.last.created_at,
                unread_count: accum.unread,
            });
        }
        Ok(result)
    }

    /// Group directory for `user`: every group with member count,
    /// membership flag and latest message, newest groups first.
    pub async fn group_inbox(&self, user: Uuid) -> ChatResult<Vec<GroupPreview>> {
        let user_s = user.to_string();
        let rows = self.with_db(move |db| db.list_groups(&user_s)).await?;

        Ok(rows
            .into_iter()
            .map(|row| GroupPreview {
                group_id: parse_uuid(&row.id, "group id"),
                name: row.name,
                created_at: parse_timestamp(&row.created_at),
                member_count: row.member_count,
                is_member: row.is_member,
                last_message: row.last_message,
                last_message_at: row.last_message_at.as_deref().map(parse_timestamp),
            })
            .collect())
    }

}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mingle_db::Database;
    use mingle_feed::Feed;
    use mingle_types::models::Profile;
    use uuid::Uuid;

    use crate::profiles::StaticProfileDirectory;
    use super::*;

    fn service(profiles: Vec<Profile>) -> ChatService {
        let db = Arc::new(Database::open_in_memory().unwrap());
        ChatService::new(db, Feed::new(), Arc::new(StaticProfileDirectory::new(profiles)))
    }

    fn profile(id: Uuid, username: &str) -> Profile {
        Profile { id, username: username.into(), avatar_url: None }
    }

    #[tokio::test]
    async fn unread_counts_track_sends_and_seen() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let svc = service(vec![profile(alice, "alice"), profile(bob, "bob")]);

        svc.send_direct(alice, bob, "hi").await.unwrap();
        let before = svc.inbox(bob, None).await.unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].unread_count, 1);

        svc.send_direct(alice, bob, "you there?").await.unwrap();
        let after_second = svc.inbox(bob, None).await.unwrap();
        assert_eq!(after_second[0].unread_count, 2);
        assert_eq!(after_second[0].last_message, "you there?");

        svc.mark_seen(bob, alice).await.unwrap();
        let after_seen = svc.inbox(bob, None).await.unwrap();
        assert_eq!(after_seen[0].unread_count, 0);
    }

    #[tokio::test]
    async fn full_delivery_scenario() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let svc = service(vec![profile(alice, "alice"), profile(bob, "bob")]);

        // Alice sends; Bob loads the conversation, then marks it seen.
        svc.send_direct(alice, bob, "hello").await.unwrap();
        svc.mark_delivered(bob, alice).await.unwrap();
        let listed = svc.list_direct(bob, alice).await.unwrap();
        assert_eq!(listed[0].status, mingle_types::models::DeliveryStatus::Delivered);
        svc.mark_seen(bob, alice).await.unwrap();

        // Alice's inbox preview for Bob: nothing unread, latest content shown.
        let inbox = svc.inbox(alice, None).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].counterpart_id, bob);
        assert_eq!(inbox[0].username, "bob");
        assert_eq!(inbox[0].last_message, "hello");
        assert_eq!(inbox[0].unread_count, 0);
    }

    #[tokio::test]
    async fn conversations_are_ordered_by_recency() {
        let me = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let svc = service(vec![]);

        svc.send_direct(first, me, "old").await.unwrap();
        svc.send_direct(second, me, "new").await.unwrap();

        let inbox = svc.inbox(me, None).await.unwrap();
        assert_eq!(inbox[0].counterpart_id, second);
        assert_eq!(inbox[1].counterpart_id, first);

        // Unknown profiles degrade to the sentinel, not an error.
        assert_eq!(inbox[0].username, UNKNOWN_USER);
    }

    #[tokio::test]
    async fn bounded_window_limits_what_is_counted() {
        let me = Uuid::new_v4();
        let friend = Uuid::new_v4();
        let svc = service(vec![]);

        for i in 0..7 {
            svc.send_direct(friend, me, &format!("m{i}")).await.unwrap();
        }

        let windowed = svc.inbox(me, Some(5)).await.unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].unread_count, 5);
        assert_eq!(windowed[0].last_message, "m6");

        let full = svc.inbox(me, None).await.unwrap();
        assert_eq!(full[0].unread_count, 7);
    }

    #[tokio::test]
    async fn group_directory_previews_for_user() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let svc = service(vec![]);

        let hikers = svc.create_group(alice, "hikers").await.unwrap();
        let readers = svc.create_group(bob, "readers").await.unwrap();
        svc.send_group(alice, hikers.id, "trail at 9").await.unwrap();

        let directory = svc.group_inbox(alice).await.unwrap();
        assert_eq!(directory.len(), 2);
        // Newest group first.
        assert_eq!(directory[0].group_id, readers.id);
        assert!(!directory[0].is_member);
        assert!(directory[0].last_message.is_none());

        assert_eq!(directory[1].group_id, hikers.id);
        assert!(directory[1].is_member);
        assert_eq!(directory[1].member_count, 1);
        assert_eq!(directory[1].last_message.as_deref(), Some("trail at 9"));
    }
}
