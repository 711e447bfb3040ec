use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chatline_core::CoreError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rate limited")]
    RateLimited,
    #[error("service unavailable")]
    Unavailable,
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message, "message": message }))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::AuthenticationAbsent => ApiError::Unauthorized,
            CoreError::AuthorizationDenied
            | CoreError::NotParticipant
            | CoreError::NotSubscribed => ApiError::Forbidden,
            CoreError::Payload(_) | CoreError::ChannelParse(_) => {
                ApiError::BadRequest(e.client_message())
            }
            CoreError::UnknownMethod(_) => ApiError::NotFound,
            CoreError::AlreadySubscribed => ApiError::Conflict(e.client_message()),
            CoreError::RateLimited { .. } => ApiError::RateLimited,
            CoreError::Cancelled => ApiError::Unavailable,
            CoreError::Backend(_) | CoreError::Database(_) | CoreError::Config(_) => {
                ApiError::Internal(anyhow::anyhow!(e))
            }
        }
    }
}
