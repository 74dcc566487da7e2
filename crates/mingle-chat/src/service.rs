//! The messaging core: sends, ordered listings, delivery-state transitions
//! and the group membership ledger. Every operation takes the acting user's
//! id explicitly. Mutations hold the write-order lock from before the store
//! commit until after their change events are published, so feed publish
//! order always matches commit order and an entity's update can never be
//! observed before its insert.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use mingle_db::Database;
use mingle_db::models::{GroupMessageRow, GroupRow, MemberRow, MessageRow};
use mingle_feed::Feed;
use mingle_types::error::{ChatError, ChatResult};
use mingle_types::events::{ChangeEvent, ChangePayload};
use mingle_types::models::{DeliveryStatus, Group, GroupMember, GroupMessage, Message};

use crate::profiles::ProfileDirectory;

#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    feed: Feed,
    profiles: Arc<dyn ProfileDirectory>,
    // Every mutation holds this across commit + publish. A transition that
    // saw a committed row therefore publishes after that row's own events.
    write_order: Arc<tokio::sync::Mutex<()>>,
}

impl ChatService {
    pub fn new(db: Arc<Database>, feed: Feed, profiles: Arc<dyn ProfileDirectory>) -> Self {
        Self {
            db,
            feed,
            profiles,
            write_order: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn feed(&self) -> Feed {
        self.feed.clone()
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileDirectory> {
        &self.profiles
    }

    /// Run blocking store work off the async runtime.
    pub(crate) async fn with_db<F, T>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Database) -> ChatResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ChatError::Store(format!("task join error: {e}"))
            })?
    }

    // -- Direct messages --

    pub async fn send_direct(&self, sender: Uuid, receiver: Uuid, content: &str) -> ChatResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation("message content is empty".into()));
        }

        let _order = self.write_order.lock().await;
        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: content.to_string(),
            status: DeliveryStatus::Sent.as_str().to_string(),
            created_at: timestamp_now(),
        };

        let row = self
            .with_db(move |db| {
                db.insert_message(&row)?;
                Ok(row)
            })
            .await?;

        let message = message_from_row(row);
        self.feed
            .publish(ChangeEvent::insert(ChangePayload::Message(message.clone())));
        Ok(message)
    }

    /// Both directions of the conversation, oldest first. Symmetric in its
    /// arguments.
    pub async fn list_direct(&self, user: Uuid, other: Uuid) -> ChatResult<Vec<Message>> {
        let (a, b) = (user.to_string(), other.to_string());
        let rows = self.with_db(move |db| db.direct_messages(&a, &b)).await?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    /// Everything `sender` has pending toward `receiver` becomes delivered.
    /// Idempotent; returns the messages that actually transitioned.
    pub async fn mark_delivered(&self, receiver: Uuid, sender: Uuid) -> ChatResult<Vec<Message>> {
        let (r, s) = (receiver.to_string(), sender.to_string());
        let _order = self.write_order.lock().await;
        let rows = self.with_db(move |db| db.mark_direct_delivered(&r, &s)).await?;
        Ok(self.publish_direct_updates(rows))
    }

    /// The whole visible history from `sender` becomes seen in one atomic
    /// bulk update. Idempotent under repetition.
    pub async fn mark_seen(&self, receiver: Uuid, sender: Uuid) -> ChatResult<Vec<Message>> {
        let (r, s) = (receiver.to_string(), sender.to_string());
        let _order = self.write_order.lock().await;
        let rows = self.with_db(move |db| db.mark_direct_seen(&r, &s)).await?;
        Ok(self.publish_direct_updates(rows))
    }

    /// Single-message forward transition. No-op (not an error) when the
    /// message is already at or past `target`.
    pub async fn advance_status(
        &self,
        message_id: Uuid,
        by: Uuid,
        target: DeliveryStatus,
    ) -> ChatResult<Message> {
        let id = message_id.to_string();
        let actor = by.to_string();

        let _order = self.write_order.lock().await;
        let (changed, row) = self
            .with_db(move |db| {
                let row = db
                    .get_message(&id)?
                    .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?;
                if row.sender_id == actor {
                    return Err(ChatError::Permission(
                        "the author cannot advance their own message".into(),
                    ));
                }
                if row.receiver_id != actor {
                    return Err(ChatError::Permission(
                        "only the receiver may advance a message".into(),
                    ));
                }
                let before = row.status.clone();
                let updated = db
                    .advance_message_status(&id, target.as_str(), target as i64)?
                    .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?;
                Ok((updated.status != before, updated))
            })
            .await?;

        let message = message_from_row(row);
        if changed {
            self.feed
                .publish(ChangeEvent::update(ChangePayload::Message(message.clone())));
        }
        Ok(message)
    }

    fn publish_direct_updates(&self, rows: Vec<MessageRow>) -> Vec<Message> {
        let messages: Vec<Message> = rows.into_iter().map(message_from_row).collect();
        for message in &messages {
            self.feed
                .publish(ChangeEvent::update(ChangePayload::Message(message.clone())));
        }
        messages
    }

    // -- Group messages --

    pub async fn send_group(&self, user: Uuid, group: Uuid, content: &str) -> ChatResult<GroupMessage> {
        let user_s = user.to_string();
        let group_s = group.to_string();
        let content = content.trim().to_string();

        let _order = self.write_order.lock().await;
        let row = self
            .with_db(move |db| {
                if !db.is_member(&group_s, &user_s)? {
                    return Err(ChatError::Permission(
                        "only group members may post to a group".into(),
                    ));
                }
                if content.is_empty() {
                    return Err(ChatError::Validation("message content is empty".into()));
                }
                let row = GroupMessageRow {
                    id: Uuid::new_v4().to_string(),
                    group_id: group_s,
                    user_id: user_s,
                    content,
                    status: DeliveryStatus::Sent.as_str().to_string(),
                    created_at: timestamp_now(),
                };
                db.insert_group_message(&row)?;
                Ok(row)
            })
            .await?;

        let message = group_message_from_row(row);
        self.feed
            .publish(ChangeEvent::insert(ChangePayload::GroupMessage(message.clone())));
        Ok(message)
    }

    pub async fn list_group(&self, user: Uuid, group: Uuid) -> ChatResult<Vec<GroupMessage>> {
        let user_s = user.to_string();
        let group_s = group.to_string();
        let rows = self
            .with_db(move |db| {
                if !db.is_member(&group_s, &user_s)? {
                    return Err(ChatError::Permission(
                        "only group members may read a group".into(),
                    ));
                }
                db.group_messages(&group_s)
            })
            .await?;
        Ok(rows.into_iter().map(group_message_from_row).collect())
    }

    pub async fn mark_group_delivered(&self, user: Uuid, group: Uuid) -> ChatResult<Vec<GroupMessage>> {
        let user_s = user.to_string();
        let group_s = group.to_string();
        let _order = self.write_order.lock().await;
        let rows = self
            .with_db(move |db| {
                if !db.is_member(&group_s, &user_s)? {
                    return Err(ChatError::Permission(
                        "only group members may advance group messages".into(),
                    ));
                }
                db.mark_group_delivered(&group_s, &user_s)
            })
            .await?;
        Ok(self.publish_group_updates(rows))
    }

    pub async fn mark_group_seen(&self, user: Uuid, group: Uuid) -> ChatResult<Vec<GroupMessage>> {
        let user_s = user.to_string();
        let group_s = group.to_string();
        let _order = self.write_order.lock().await;
        let rows = self
            .with_db(move |db| {
                if !db.is_member(&group_s, &user_s)? {
                    return Err(ChatError::Permission(
                        "only group members may advance group messages".into(),
                    ));
                }
                db.mark_group_seen(&group_s, &user_s)
            })
            .await?;
        Ok(self.publish_group_updates(rows))
    }

    pub async fn advance_group_status(
        &self,
        message_id: Uuid,
        by: Uuid,
        target: DeliveryStatus,
    ) -> ChatResult<GroupMessage> {
        let id = message_id.to_string();
        let actor = by.to_string();

        let _order = self.write_order.lock().await;
        let (changed, row) = self
            .with_db(move |db| {
                let row = db
                    .get_group_message(&id)?
                    .ok_or_else(|| ChatError::NotFound(format!("group message {id}")))?;
                if row.user_id == actor {
                    return Err(ChatError::Permission(
                        "the author cannot advance their own message".into(),
                    ));
                }
                if !db.is_member(&row.group_id, &actor)? {
                    return Err(ChatError::Permission(
                        "only group members may advance group messages".into(),
                    ));
                }
                let before = row.status.clone();
                let updated = db
                    .advance_group_message_status(&id, target.as_str(), target as i64)?
                    .ok_or_else(|| ChatError::NotFound(format!("group message {id}")))?;
                Ok((updated.status != before, updated))
            })
            .await?;

        let message = group_message_from_row(row);
        if changed {
            self.feed
                .publish(ChangeEvent::update(ChangePayload::GroupMessage(message.clone())));
        }
        Ok(message)
    }

    fn publish_group_updates(&self, rows: Vec<GroupMessageRow>) -> Vec<GroupMessage> {
        let messages: Vec<GroupMessage> = rows.into_iter().map(group_message_from_row).collect();
        for message in &messages {
            self.feed
                .publish(ChangeEvent::update(ChangePayload::GroupMessage(message.clone())));
        }
        messages
    }

    // -- Groups and membership ledger --

    /// Create a group; the creator joins in the same transaction.
    pub async fn create_group(&self, user: Uuid, name: &str) -> ChatResult<Group> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::Validation("group name is empty".into()));
        }

        let _order = self.write_order.lock().await;
        let now = timestamp_now();
        let group_row = GroupRow {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_by: user.to_string(),
            created_at: now.clone(),
        };
        let member_row = MemberRow {
            group_id: group_row.id.clone(),
            user_id: user.to_string(),
            joined_at: now,
        };

        let (group_row, member_row) = self
            .with_db(move |db| {
                db.insert_group_with_creator(&group_row, &member_row)?;
                Ok((group_row, member_row))
            })
            .await?;

        let group = group_from_row(group_row);
        self.feed
            .publish(ChangeEvent::insert(ChangePayload::Group(group.clone())));
        self.feed
            .publish(ChangeEvent::insert(ChangePayload::Membership(member_from_row(member_row))));
        Ok(group)
    }

    /// Idempotent join. Returns whether a membership row was created; a
    /// repeat join is a silent no-op and publishes nothing.
    pub async fn join_group(&self, user: Uuid, group: Uuid) -> ChatResult<bool> {
        let group_s = group.to_string();
        let _order = self.write_order.lock().await;
        let row = MemberRow {
            group_id: group_s.clone(),
            user_id: user.to_string(),
            joined_at: timestamp_now(),
        };

        let (joined, row) = self
            .with_db(move |db| {
                if db.get_group(&group_s)?.is_none() {
                    return Err(ChatError::NotFound(format!("group {group_s}")));
                }
                let joined = db.insert_member(&row)?;
                Ok((joined, row))
            })
            .await?;

        if joined {
            self.feed
                .publish(ChangeEvent::insert(ChangePayload::Membership(member_from_row(row))));
        }
        Ok(joined)
    }

    pub async fn is_member(&self, user: Uuid, group: Uuid) -> ChatResult<bool> {
        let (g, u) = (group.to_string(), user.to_string());
        self.with_db(move |db| db.is_member(&g, &u)).await
    }

    pub async fn member_count(&self, group: Uuid) -> ChatResult<u32> {
        let g = group.to_string();
        self.with_db(move |db| db.member_count(&g)).await
    }

    pub async fn members(&self, group: Uuid) -> ChatResult<Vec<GroupMember>> {
        let g = group.to_string();
        let rows = self.with_db(move |db| db.list_members(&g)).await?;
        Ok(rows.into_iter().map(member_from_row).collect())
    }
}

// -- Row conversions --
//
// SQLite hands back text columns; corrupt values degrade with a warning
// instead of failing reads, matching the graceful-read policy.

pub(crate) fn timestamp_now() -> String {
    // RFC 3339 with fixed-width microseconds: lexicographic order in the
    // store equals chronological order.
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_uuid(value: &str, what: &str) -> Uuid {
    value.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, value, e);
        Uuid::default()
    })
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    value.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt timestamp '{}': {}", value, e);
        DateTime::default()
    })
}

pub(crate) fn parse_status(value: &str) -> DeliveryStatus {
    DeliveryStatus::parse(value).unwrap_or_else(|| {
        warn!("Corrupt delivery status '{}'", value);
        DeliveryStatus::Sent
    })
}

pub(crate) fn message_from_row(row: MessageRow) -> Message {
    Message {
        id: parse_uuid(&row.id, "message id"),
        sender_id: parse_uuid(&row.sender_id, "sender_id"),
        receiver_id: parse_uuid(&row.receiver_id, "receiver_id"),
        content: row.content,
        created_at: parse_timestamp(&row.created_at),
        status: parse_status(&row.status),
    }
}

pub(crate) fn group_message_from_row(row: GroupMessageRow) -> GroupMessage {
    GroupMessage {
        id: parse_uuid(&row.id, "group message id"),
        group_id: parse_uuid(&row.group_id, "group_id"),
        user_id: parse_uuid(&row.user_id, "user_id"),
        content: row.content,
        created_at: parse_timestamp(&row.created_at),
        status: parse_status(&row.status),
    }
}

pub(crate) fn group_from_row(row: GroupRow) -> Group {
    Group {
        id: parse_uuid(&row.id, "group id"),
        name: row.name,
        created_by: parse_uuid(&row.created_by, "created_by"),
        created_at: parse_timestamp(&row.created_at),
    }
}

pub(crate) fn member_from_row(row: MemberRow) -> GroupMember {
    GroupMember {
        group_id: parse_uuid(&row.group_id, "group_id"),
        user_id: parse_uuid(&row.user_id, "user_id"),
        joined_at: parse_timestamp(&row.joined_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mingle_feed::{EventFilter, FeedItem};
    use mingle_types::events::Operation;
    use mingle_types::models::Profile;
    use crate::profiles::StaticProfileDirectory;

    fn service_with(profiles: Vec<Profile>) -> ChatService {
        let db = Arc::new(Database::open_in_memory().unwrap());
        ChatService::new(db, Feed::new(), Arc::new(StaticProfileDirectory::new(profiles)))
    }

    fn service() -> ChatService {
        service_with(vec![])
    }

    #[tokio::test]
    async fn send_rejects_blank_content() {
        let svc = service();
        let err = svc
            .send_direct(Uuid::new_v4(), Uuid::new_v4(), "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn listing_is_symmetric() {
        let svc = service();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        svc.send_direct(alice, bob, "one").await.unwrap();
        svc.send_direct(bob, alice, "two").await.unwrap();

        let ab: Vec<Uuid> = svc.list_direct(alice, bob).await.unwrap().iter().map(|m| m.id).collect();
        let ba: Vec<Uuid> = svc.list_direct(bob, alice).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 2);
    }

    #[tokio::test]
    async fn delivery_lifecycle() {
        let svc = service();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let sent = svc.send_direct(alice, bob, "hello").await.unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);

        let delivered = svc.mark_delivered(bob, alice).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status, DeliveryStatus::Delivered);

        let seen = svc.mark_seen(bob, alice).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, DeliveryStatus::Seen);

        // Second bulk application changes nothing: idempotent.
        assert!(svc.mark_seen(bob, alice).await.unwrap().is_empty());
        let listed = svc.list_direct(alice, bob).await.unwrap();
        assert!(listed.iter().all(|m| m.status == DeliveryStatus::Seen));
    }

    #[tokio::test]
    async fn advance_is_forward_only_and_receiver_gated() {
        let svc = service();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let msg = svc.send_direct(alice, bob, "hi").await.unwrap();

        // Author may not touch it.
        let err = svc.advance_status(msg.id, alice, DeliveryStatus::Seen).await.unwrap_err();
        assert!(matches!(err, ChatError::Permission(_)));

        // Neither may a third party.
        let err = svc.advance_status(msg.id, carol, DeliveryStatus::Seen).await.unwrap_err();
        assert!(matches!(err, ChatError::Permission(_)));

        // Receiver skips straight to seen (both are receiver-side effects).
        let seen = svc.advance_status(msg.id, bob, DeliveryStatus::Seen).await.unwrap();
        assert_eq!(seen.status, DeliveryStatus::Seen);

        // Stale target is a no-op, not an error.
        let still_seen = svc.advance_status(msg.id, bob, DeliveryStatus::Delivered).await.unwrap();
        assert_eq!(still_seen.status, DeliveryStatus::Seen);

        let err = svc
            .advance_status(Uuid::new_v4(), bob, DeliveryStatus::Seen)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn feed_sees_insert_before_update() {
        let svc = service();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut sub = svc.feed().subscribe(EventFilter::for_user(bob));

        let msg = svc.send_direct(alice, bob, "hello").await.unwrap();
        svc.mark_seen(bob, alice).await.unwrap();

        let Some(FeedItem::Event(first)) = sub.recv().await else { panic!("no insert") };
        let Some(FeedItem::Event(second)) = sub.recv().await else { panic!("no update") };
        assert_eq!(first.op, Operation::Insert);
        assert_eq!(second.op, Operation::Update);
        let ChangePayload::Message(updated) = second.payload else { panic!() };
        assert_eq!(updated.id, msg.id);
        assert_eq!(updated.status, DeliveryStatus::Seen);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_seen_never_reorders_feed() {
        // A receiver that polls mark_seen can observe the committed row
        // before the sender's task resumes. The write-order lock must keep
        // the resulting update event behind the insert event regardless.
        for round in 0..100 {
            let svc = service();
            let alice = Uuid::new_v4();
            let bob = Uuid::new_v4();
            let mut sub = svc.feed().subscribe(EventFilter::for_user(bob));

            let sender = {
                let svc = svc.clone();
                tokio::spawn(async move { svc.send_direct(alice, bob, "hi").await.unwrap() })
            };
            let reader = {
                let svc = svc.clone();
                tokio::spawn(async move {
                    while svc.mark_seen(bob, alice).await.unwrap().is_empty() {
                        tokio::task::yield_now().await;
                    }
                })
            };
            sender.await.unwrap();
            reader.await.unwrap();

            let Some(FeedItem::Event(first)) = sub.recv().await else { panic!("no first event") };
            let Some(FeedItem::Event(second)) = sub.recv().await else { panic!("no second event") };
            assert_eq!(first.op, Operation::Insert, "round {round}");
            assert_eq!(second.op, Operation::Update, "round {round}");
        }
    }

    #[tokio::test]
    async fn group_isolation() {
        let svc = service();
        let alice = Uuid::new_v4();
        let mallory = Uuid::new_v4();
        let group = svc.create_group(alice, "hikers").await.unwrap();

        let err = svc.send_group(mallory, group.id, "let me in").await.unwrap_err();
        assert!(matches!(err, ChatError::Permission(_)));
        let err = svc.list_group(mallory, group.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Permission(_)));

        // Membership check fires before validation for outsiders.
        let err = svc.send_group(mallory, group.id, "").await.unwrap_err();
        assert!(matches!(err, ChatError::Permission(_)));
    }

    #[tokio::test]
    async fn creator_is_a_member_and_can_post() {
        let svc = service();
        let alice = Uuid::new_v4();
        let group = svc.create_group(alice, "  hikers  ").await.unwrap();
        assert_eq!(group.name, "hikers");
        assert!(svc.is_member(alice, group.id).await.unwrap());
        assert_eq!(svc.member_count(group.id).await.unwrap(), 1);

        let msg = svc.send_group(alice, group.id, "first!").await.unwrap();
        assert_eq!(msg.status, DeliveryStatus::Sent);
        assert_eq!(svc.list_group(alice, group.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn join_is_idempotent_under_concurrency() {
        let svc = service();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let group = svc.create_group(alice, "hikers").await.unwrap();

        let (b1, b2, c1) = tokio::join!(
            svc.join_group(bob, group.id),
            svc.join_group(bob, group.id),
            svc.join_group(carol, group.id),
        );
        // Exactly one of bob's joins created a row.
        assert_eq!(b1.unwrap() as u8 + b2.unwrap() as u8, 1);
        assert!(c1.unwrap());

        assert_eq!(svc.member_count(group.id).await.unwrap(), 3);
        let members = svc.members(group.id).await.unwrap();
        assert_eq!(members.iter().filter(|m| m.user_id == bob).count(), 1);

        let err = svc.join_group(bob, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn group_seen_skips_own_messages() {
        let svc = service();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let group = svc.create_group(alice, "hikers").await.unwrap();
        svc.join_group(bob, group.id).await.unwrap();

        svc.send_group(alice, group.id, "from alice").await.unwrap();
        svc.send_group(bob, group.id, "from bob").await.unwrap();

        let seen = svc.mark_group_seen(bob, group.id).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].user_id, alice);

        let messages = svc.list_group(bob, group.id).await.unwrap();
        let own = messages.iter().find(|m| m.user_id == bob).unwrap();
        assert_eq!(own.status, DeliveryStatus::Sent);
    }
}
