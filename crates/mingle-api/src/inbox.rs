use axum::{
    Extension, Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use mingle_types::api::Claims;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InboxQuery {
    /// Bound on the message window the previews are folded from. The
    /// dashboard preview widget passes 5; omitting it folds the full
    /// history.
    pub limit: Option<u32>,
}

pub async fn get_inbox(
    State(state): State<AppState>,
    Query(query): Query<InboxQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let previews = state.chat.inbox(claims.sub, query.limit).await?;
    Ok(Json(previews))
}
