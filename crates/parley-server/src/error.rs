use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection is not registered")]
    NotRegistered,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BadRequest(_) | ServerError::InvalidAddress(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::NotRegistered => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Why a username could not be assigned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsernameError {
    #[error("Username must be at least {0} characters")]
    TooShort(usize),

    #[error("Username must be at most {0} characters")]
    TooLong(usize),

    #[error("Username may only contain a-z, 0-9 and _")]
    InvalidCharacters,

    #[error("Username is already taken")]
    Taken,

    #[error("Register before choosing a username")]
    NotRegistered,
}
