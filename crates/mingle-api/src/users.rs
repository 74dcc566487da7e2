use axum::{Extension, Json, extract::State, response::IntoResponse};

use mingle_types::api::Claims;

use crate::error::ApiError;
use crate::state::AppState;

/// Everyone the caller could start a conversation with, excluding
/// themselves. Backed by the external profile directory.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let profiles = state
        .chat
        .profiles()
        .list_profiles(Some(claims.sub))
        .await?;
    Ok(Json(profiles))
}
