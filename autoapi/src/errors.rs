use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::db::DbError;
use crate::response::Envelope;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Connection(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Security(String),

    #[error("{0}")]
    Generation(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub const fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Connection(_) => "connection_error",
            ApiError::Timeout(_) => "timeout",
            ApiError::Security(_) => "security_error",
            ApiError::Generation(_) => "generation_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Connection(_) => StatusCode::BAD_GATEWAY,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Security(_) => StatusCode::FORBIDDEN,
            ApiError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::Validation(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::Connection(m)
            | ApiError::Timeout(m)
            | ApiError::Security(m)
            | ApiError::Generation(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match &e {
            DbError::Integrity { .. } => ApiError::Conflict(e.to_string()),
            DbError::DoesNotExist => ApiError::NotFound(e.to_string()),
            DbError::Temporary(_) => ApiError::Connection(e.to_string()),
            DbError::Bind(_) => ApiError::Validation(e.to_string()),
            DbError::Decode(_) | DbError::Fatal(_) => {
                tracing::error!("Database failure: {:?}", e);
                ApiError::Internal("database error".to_string())
            }
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Validation(format!("Invalid JSON: {}", e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        } else {
            tracing::debug!(code = self.code(), "{}", self);
        }
        Envelope::<()>::failure(status, self.message()).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
