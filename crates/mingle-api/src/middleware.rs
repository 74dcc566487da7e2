use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{DecodingKey, Validation, decode};

use mingle_types::api::Claims;
use mingle_types::error::ChatError;

use crate::error::ApiError;
use crate::state::AppState;

/// Extract and validate the bearer token issued by the external identity
/// service, making `Claims` available to handlers. Every core operation
/// downstream takes the acting user id from these claims explicitly.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError(ChatError::Unauthenticated))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError(ChatError::Unauthenticated))?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError(ChatError::Unauthenticated))?;

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}
