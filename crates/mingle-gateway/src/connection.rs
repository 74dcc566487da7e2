//! One WebSocket connection: identify, then stream change events scoped to
//! what the client subscribed to.
//!
//! The client opens with an `Identify` carrying a bearer token from the
//! external identity service. After `Ready`, it may send `Subscribe` at any
//! time to re-scope which conversations it watches; group scopes are
//! checked against the membership ledger before they take effect. Events
//! arrive in feed publish order, so a message's update never precedes its
//! insert on the same connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use mingle_chat::ChatService;
use mingle_feed::{EventFilter, FeedItem};
use mingle_types::api::Claims;
use mingle_types::events::{GatewayCommand, GatewayFrame};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh connection gets to send its Identify command.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn handle_connection(socket: WebSocket, chat: ChatService, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayFrame::Ready { user_id, username: username.clone() };
    if send_frame(&mut sender, &ready).await.is_err() {
        return;
    }

    // Until the first Subscribe the client sees its own direct traffic and
    // the group directory, but no group conversations.
    let initial_filter = EventFilter::for_user(user_id).with_directory(true);
    let mut subscription = chat.feed().subscribe(initial_filter);

    // Re-scope requests flow from the read task to the send task.
    let (filter_tx, mut filter_rx) = mpsc::unbounded_channel::<EventFilter>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                item = subscription.recv() => {
                    let frame = match item {
                        Some(FeedItem::Event(event)) => GatewayFrame::Change(event),
                        Some(FeedItem::Lagged(skipped)) => {
                            warn!("Subscriber lagged by {} events", skipped);
                            GatewayFrame::Lagged { skipped }
                        }
                        None => break,
                    };
                    if send_frame(&mut sender, &frame).await.is_err() {
                        break;
                    }
                }
                new_filter = filter_rx.recv() => {
                    match new_filter {
                        Some(filter) => subscription.set_filter(filter),
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let chat_recv = chat.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    let command: GatewayCommand = match serde_json::from_str(&text) {
                        Ok(command) => command,
                        Err(e) => {
                            warn!("Unparseable gateway command from {}: {}", username_recv, e);
                            continue;
                        }
                    };
                    match command {
                        // A second Identify on a live connection is ignored.
                        GatewayCommand::Identify { .. } => continue,
                        GatewayCommand::Subscribe { counterparts, groups, directory } => {
                            let filter = build_filter(
                                &chat_recv,
                                user_id,
                                counterparts,
                                groups,
                                directory,
                            )
                            .await;
                            if filter_tx.send(filter).is_err() {
                                break;
                            }
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Translate a Subscribe command into a feed filter. Group scopes the user
/// does not belong to are dropped with a warning — subscriptions can never
/// widen visibility past the membership ledger.
async fn build_filter(
    chat: &ChatService,
    user_id: Uuid,
    counterparts: Vec<Uuid>,
    groups: Vec<Uuid>,
    directory: bool,
) -> EventFilter {
    let mut allowed_groups = Vec::with_capacity(groups.len());
    for group in groups {
        match chat.is_member(user_id, group).await {
            Ok(true) => allowed_groups.push(group),
            Ok(false) => {
                warn!("{} subscribed to group {} without membership, ignoring", user_id, group);
            }
            Err(e) => {
                warn!("Membership check for group {} failed: {}", group, e);
            }
        }
    }

    let mut filter = EventFilter::for_user(user_id)
        .with_groups(allowed_groups)
        .with_directory(directory);
    // An empty counterpart list means "all of my conversations".
    if !counterparts.is_empty() {
        filter = filter.with_counterparts(counterparts);
    }
    filter
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    let deadline = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(message)) = receiver.next().await {
            let Message::Text(text) = message else { continue };
            match serde_json::from_str::<GatewayCommand>(&text) {
                Ok(GatewayCommand::Identify { token }) => {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;
                    return Some((token_data.claims.sub, token_data.claims.username));
                }
                Ok(_) => return None,
                Err(_) => continue,
            }
        }
        None
    });
    deadline.await.ok().flatten()
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &GatewayFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    sender.send(Message::Text(text.into())).await
}
