//! API error types and the JSON error envelope
//!
//! Every handler error renders as `{"success": false, "text": ...}` with
//! a status from the error taxonomy: auth and validation problems are
//! 403s, lookups that found nothing are 404s, peer transport failures are
//! 502s, and backend (Elasticsearch) failures are 500s.

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    /// Missing/invalid credentials or a failed permission gate
    Auth(String),
    /// Unknown hunt, cron, session, file
    NotFound(String),
    /// Bad body field, bad enum, name collision, regex compile failure
    Validation(String),
    /// Peer or remote cluster unreachable
    Transport(String),
    /// Elasticsearch failure
    Backend(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) | ApiError::Validation(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Transport(_) => StatusCode::BAD_GATEWAY,
            ApiError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn text(&self) -> &str {
        match self {
            ApiError::Auth(t)
            | ApiError::NotFound(t)
            | ApiError::Validation(t)
            | ApiError::Transport(t)
            | ApiError::Backend(t) => t,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("API error {}: {}", status, self.text());
        } else {
            tracing::debug!("API error {}: {}", status, self.text());
        }
        (status, Json(json!({ "success": false, "text": self.text() }))).into_response()
    }
}

/// Backend failures are the catch-all for anyhow errors out of the store.
impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Backend(e.to_string())
    }
}

/// The success envelope used by mutation endpoints.
pub fn success(text: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "text": text.into() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::Auth("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Transport("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::Backend("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
