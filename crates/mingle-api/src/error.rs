use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use mingle_types::error::ChatError;

/// Bridges the core error taxonomy onto HTTP responses.
pub struct ApiError(pub ChatError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::Permission(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ChatError::Store(ref detail) = self.0 {
            error!("Store failure surfaced to client: {}", detail);
        }
        (self.status(), Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        let cases = [
            (ChatError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ChatError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (ChatError::Permission("x".into()), StatusCode::FORBIDDEN),
            (ChatError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ChatError::Store("x".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }
}
