use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use mingle_types::api::{AdvanceStatusRequest, Claims, SendMessageRequest};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn send_message(
    State(state): State<AppState>,
    Path(other_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .chat
        .send_direct(claims.sub, other_id, &req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Loading a conversation is the delivery signal: everything the
/// counterpart sent that was still `sent` becomes `delivered` before the
/// listing is returned, so the caller sees post-transition rows.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(other_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state.chat.mark_delivered(claims.sub, other_id).await?;
    let messages = state.chat.list_direct(claims.sub, other_id).await?;
    Ok(Json(messages))
}

/// Explicit "conversation is open" acknowledgment: the whole visible
/// history from the counterpart becomes seen in one bulk update. Safe to
/// call repeatedly.
pub async fn mark_seen(
    State(state): State<AppState>,
    Path(other_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.chat.mark_seen(claims.sub, other_id).await?;
    Ok(Json(updated))
}

pub async fn advance_status(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AdvanceStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .chat
        .advance_status(message_id, claims.sub, req.target)
        .await?;
    Ok(Json(message))
}
