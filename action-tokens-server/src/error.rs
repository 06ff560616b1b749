//! HTTP error mapping.

use action_tokens_core::{ErrorClass, TokenError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("token {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Token(e) => {
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Token(e) if e.class() == ErrorClass::Internal => {
                tracing::error!(error = %e, "token request failed");
            }
            _ => tracing::debug!(status = %status, error = %self, "token request rejected"),
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_tokens_core::StorageError;

    #[test]
    fn test_status_follows_token_error() {
        assert_eq!(AppError::NotFound("t".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::from(TokenError::AlreadyExecuted("t".into())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from(TokenError::Expired("t".into())).status(),
            StatusCode::GONE
        );
        assert_eq!(
            AppError::from(TokenError::Storage(StorageError::SessionClosed)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
