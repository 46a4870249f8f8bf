use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::dispatch::DispatchError;

/// Error type for all HTTP handlers.
///
/// Each variant maps to a status code and a human-readable message. The
/// body is always `{"success": false, "error": "<message>"}`.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Missing or malformed request field.
    BadRequest(String),
    /// 404 - No such route.
    NotFound,
    /// 403 - WebSocket upgrade from a foreign origin.
    OriginNotAllowed(String),
    /// 500 - The host command failed; carries its message verbatim.
    CommandFailed(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
            ApiError::CommandFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::BadRequest(detail) => detail.clone(),
            ApiError::NotFound => "Not found".to_string(),
            ApiError::OriginNotAllowed(origin) => format!("Origin not allowed: {}", origin),
            ApiError::CommandFailed(detail) => detail.clone(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::BadRequest(detail) => ApiError::BadRequest(detail),
            DispatchError::Host(e) => ApiError::CommandFailed(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
