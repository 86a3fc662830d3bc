use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::layers::{REQUEST_ID_HEADER, current_trace_id};

/// Body shape shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
    pub success: bool,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl<T> Envelope<T> {
    pub fn new(status: StatusCode, message: impl Into<String>, data: Option<T>) -> Self {
        let code = status.as_u16();
        Self {
            code,
            message: message.into(),
            data,
            success: (200..300).contains(&code),
            timestamp: chrono::Utc::now().timestamp_millis(),
            trace_id: current_trace_id(),
        }
    }

    pub fn ok(data: T) -> Self {
        Self::new(StatusCode::OK, "success", Some(data))
    }

    pub fn created(data: T) -> Self {
        Self::new(StatusCode::CREATED, "created", Some(data))
    }

    pub fn failure(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, message, None)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let trace_id = self.trace_id.clone();
        let mut response = (status, Json(self)).into_response();
        if let Some(id) = trace_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, id);
        }
        response
    }
}
