//! API error types with structured JSON responses, plus the shared error
//! taxonomy for outbound collaborator calls.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Authentication required")]
    Unauthorized,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Validation(detail) => (StatusCode::BAD_REQUEST, "VALIDATION", detail),
            AppError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "AUTH_REQUIRED",
                "Authentication required".to_string(),
            ),
            AppError::Internal(detail) => {
                tracing::error!("API internal error: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };

        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Collaborator errors
// ============================================================================

/// Failure classes shared by every outbound collaborator client (OCR,
/// chat completion, table/object storage, secret store).
///
/// The classes are distinguished so logs can tell access problems from
/// throttling from plain transport faults; see the HTTP layer for how each
/// class maps onto the user-facing taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("access denied by the service: {0}")]
    AccessDenied(String),
    #[error("the service is throttling requests: {0}")]
    Throttled(String),
    #[error("the service quota is exhausted: {0}")]
    QuotaExceeded(String),
    #[error("the service rejected the request: {0}")]
    MalformedRequest(String),
    #[error("unreadable response from the service: {0}")]
    Decode(String),
    #[error("service error ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl UpstreamError {
    /// Classify a non-2xx collaborator response by status code.
    pub fn from_response(status: u16, body: String) -> Self {
        match status {
            401 | 403 => UpstreamError::AccessDenied(body),
            429 => UpstreamError::Throttled(body),
            402 => UpstreamError::QuotaExceeded(body),
            400 | 422 => UpstreamError::MalformedRequest(body),
            _ => UpstreamError::Http { status, body },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn validation_returns_400() {
        let response = AppError::Validation("Unsupported file type".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "VALIDATION");
        assert_eq!(json["error"]["message"], "Unsupported file type");
    }

    #[tokio::test]
    async fn not_found_returns_404() {
        let response = AppError::NotFound("Report abc not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn unauthorized_returns_401() {
        let response = AppError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn internal_returns_500_with_generic_body() {
        let response = AppError::Internal("bucket misconfigured".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        // Internal errors hide details from the client
        assert_eq!(json["error"]["message"], "An internal error occurred");
    }

    #[test]
    fn upstream_classification_by_status() {
        assert!(matches!(
            UpstreamError::from_response(403, "nope".into()),
            UpstreamError::AccessDenied(_)
        ));
        assert!(matches!(
            UpstreamError::from_response(429, "slow down".into()),
            UpstreamError::Throttled(_)
        ));
        assert!(matches!(
            UpstreamError::from_response(402, "pay up".into()),
            UpstreamError::QuotaExceeded(_)
        ));
        assert!(matches!(
            UpstreamError::from_response(422, "bad doc".into()),
            UpstreamError::MalformedRequest(_)
        ));
        assert!(matches!(
            UpstreamError::from_response(503, "down".into()),
            UpstreamError::Http { status: 503, .. }
        ));
    }
}
