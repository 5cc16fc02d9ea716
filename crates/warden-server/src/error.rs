use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use warden_core::models::{CoreError, CoreErrorKind};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Core(error) => {
                let status = match error.kind {
                    CoreErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    CoreErrorKind::Unauthorized | CoreErrorKind::Expired => {
                        StatusCode::UNAUTHORIZED
                    }
                    CoreErrorKind::NotFound => StatusCode::NOT_FOUND,
                    CoreErrorKind::Conflict => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, error.kind.as_str())
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let message = match &self {
            ApiError::Core(error) => error.message.clone(),
            ApiError::BadRequest(message) | ApiError::Unauthorized(message) => message.clone(),
        };

        if status.is_server_error() {
            tracing::error!(kind, message = %message, "request failed");
        } else {
            tracing::debug!(kind, status = status.as_u16(), message = %message, "request rejected");
        }

        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}
