use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::engine::EngineError;

/// Engine errors on their way out as JSON.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(EngineError::Validation(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Conflict { .. }
            | EngineError::CapacityExceeded { .. }
            | EngineError::AlreadyJoined(_) => StatusCode::CONFLICT,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) | EngineError::NotInRoster(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidTransition { .. } | EngineError::LimitExceeded(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::PartialFailure { .. } => StatusCode::MULTI_STATUS,
            EngineError::WalError(_) | EngineError::Interrupted { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn body(&self) -> Value {
        let mut body = json!({ "error": self.0.kind(), "message": self.0.to_string() });
        let extra = match &self.0 {
            EngineError::Conflict { booking } => json!({ "conflict": booking }),
            EngineError::CapacityExceeded { max_players } => json!({ "max_players": max_players }),
            EngineError::PartialFailure { recurrence_id, created, failures } => json!({
                "recurrence_id": recurrence_id,
                "created": created,
                "failures": failures,
            }),
            // Internal detail stays in the log.
            EngineError::WalError(_) => json!({ "message": "storage failure" }),
            EngineError::Interrupted { applied, .. } => json!({
                "message": "storage failure",
                "applied": applied,
            }),
            _ => return body,
        };
        if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
            body.extend(extra);
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::debug!(kind = self.0.kind(), "request rejected: {}", self.0);
        }
        (status, Json(self.body())).into_response()
    }
}
