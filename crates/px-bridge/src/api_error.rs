//! HTTP API error mapping.
//!
//! Every error leaving the REST surface is the stable body
//! `{"error": {"code", "message", "details?"}}`; the status code follows
//! the core error taxonomy.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use px_core::CoreError;

/// Wrapper that carries a [`CoreError`] across the Axum boundary.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub CoreError);

impl ApiError {
    pub fn bad_request(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self(CoreError::validation(field, reason))
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self(CoreError::Unauthorized(message.into()))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self(CoreError::Forbidden(message.into()))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self(CoreError::NotFound(message.into()))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) | CoreError::LeaseLost { .. } => StatusCode::CONFLICT,
            CoreError::StateMachineViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut error = json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        if let CoreError::Validation { fields, .. } = &self.0 {
            error["details"] = json!(fields);
        }
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": error }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn validation_carries_field_details() {
        let response = ApiError::bad_request("duration_secs", "must be positive").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "validation");
        assert_eq!(body["error"]["details"]["duration_secs"], "must be positive");
    }

    #[tokio::test]
    async fn lease_lost_is_conflict() {
        let response = ApiError(CoreError::LeaseLost {
            task_id: "task-1".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "conflict");
    }

    #[tokio::test]
    async fn state_machine_violation_is_422() {
        let response =
            ApiError(CoreError::StateMachineViolation("cannot start".into())).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
