use thiserror::Error;

/// Error taxonomy for the messaging core.
///
/// `Validation`, `Permission` and `NotFound` are surfaced to the caller and
/// never retried. `Store` covers an unavailable or failing backing store and
/// is safe for the caller to retry only on idempotent operations (the bulk
/// status transitions); the core itself never retries a send.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not allowed: {0}")]
    Permission(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Store(String),
}

pub type ChatResult<T> = Result<T, ChatError>;
