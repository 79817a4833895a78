//! HTTP API error types.
//!
//! `ApiError` maps session-layer failures onto status codes and renders them
//! as `{"error": "..."}` bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pt_core::naming::NamingError;
use pt_session::tmux::TmuxError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("tmux did not answer in time")]
    Timeout,

    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<NamingError> for ApiError {
    fn from(e: NamingError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<TmuxError> for ApiError {
    fn from(e: TmuxError) -> Self {
        match e {
            TmuxError::SessionNotFound(name) => ApiError::NotFound(format!("session {name}")),
            TmuxError::NoPane(name) => ApiError::NotFound(format!("no active pane in {name}")),
            TmuxError::Timeout { .. } => ApiError::Timeout,
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!("API error: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn body_of(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn naming_error_is_bad_request() {
        let response = ApiError::from(NamingError::InvalidSessionId).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_of(response).await.contains("invalid session id"));
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let response = ApiError::from(TmuxError::SessionNotFound("abc".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = ApiError::from(TmuxError::NoPane("abc".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn timeout_is_gateway_timeout() {
        let err = TmuxError::Timeout {
            command: "display-message".into(),
            timeout: Duration::from_secs(5),
        };
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(body_of(response).await.contains("\"error\""));
    }
}
