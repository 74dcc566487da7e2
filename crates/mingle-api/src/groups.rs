use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use uuid::Uuid;

use mingle_chat::profiles::display_name;
use mingle_types::api::{
    AdvanceStatusRequest, Claims, CreateGroupRequest, GroupMessageResponse, MemberResponse,
    SendMessageRequest,
};
use mingle_types::models::GroupMessage;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let previews = state.chat.group_inbox(claims.sub).await?;
    Ok(Json(previews))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state.chat.create_group(claims.sub, &req.name).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn join_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let joined = state.chat.join_group(claims.sub, group_id).await?;
    Ok(Json(json!({ "joined": joined })))
}

pub async fn list_members(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let members = state.chat.members(group_id).await?;

    let mut responses = Vec::with_capacity(members.len());
    for member in members {
        let username = display_name(state.chat.profiles().as_ref(), member.user_id).await;
        responses.push(MemberResponse {
            user_id: member.user_id,
            username,
            joined_at: member.joined_at,
        });
    }
    Ok(Json(responses))
}

/// Loading a group conversation is the delivery signal for its pending
/// messages, mirroring the direct-chat listing.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state.chat.mark_group_delivered(claims.sub, group_id).await?;
    let messages = state.chat.list_group(claims.sub, group_id).await?;
    let decorated = decorate_with_usernames(&state, messages).await;
    Ok(Json(decorated))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let m = state
        .chat
        .send_group(claims.sub, group_id, &req.content)
        .await?;
    let username = display_name(state.chat.profiles().as_ref(), m.user_id).await;
    let response = GroupMessageResponse {
        id: m.id,
        group_id: m.group_id,
        user_id: m.user_id,
        username,
        content: m.content,
        created_at: m.created_at,
        status: m.status,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn advance_status(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AdvanceStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .chat
        .advance_group_status(message_id, claims.sub, req.target)
        .await?;
    Ok(Json(message))
}

pub async fn mark_seen(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.chat.mark_group_seen(claims.sub, group_id).await?;
    Ok(Json(updated))
}

/// Resolve each distinct author once; unknown profiles fall back to the
/// sentinel instead of failing the listing.
async fn decorate_with_usernames(
    state: &AppState,
    messages: Vec<GroupMessage>,
) -> Vec<GroupMessageResponse> {
    let mut usernames: HashMap<Uuid, String> = HashMap::new();
    for message in &messages {
        if !usernames.contains_key(&message.user_id) {
            let username = display_name(state.chat.profiles().as_ref(), message.user_id).await;
            usernames.insert(message.user_id, username);
        }
    }

    messages
        .into_iter()
        .map(|m| {
            let username = usernames.get(&m.user_id).cloned().unwrap_or_default();
            GroupMessageResponse {
                id: m.id,
                group_id: m.group_id,
                user_id: m.user_id,
                username,
                content: m.content,
                created_at: m.created_at,
                status: m.status,
            }
        })
        .collect()
}
