use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::{EngineError, SpeechError};

/// Uniform `{status: "error", message}` failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Speech(SpeechError::Invalid(_)) => StatusCode::BAD_REQUEST,
            EngineError::OutOfRange(_) | EngineError::UnknownClip(_) => StatusCode::NOT_FOUND,
            EngineError::NotConnected(_) | EngineError::NothingPlaying | EngineError::ConnectionLost(_) => {
                StatusCode::CONFLICT
            }
            EngineError::Resolution(_) => StatusCode::BAD_GATEWAY,
            EngineError::Transport(_) | EngineError::Persistence(_) | EngineError::Speech(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, format!("Invalid request: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, format!("Invalid request: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "status": "error", "message": self.message }))).into_response()
    }
}
