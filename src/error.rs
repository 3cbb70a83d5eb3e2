//! # Error Handling
//!
//! Custom error types for the HTTP surface and their conversion to JSON
//! responses. Job-channel failures do not pass through here; they travel as
//! "error" messages on the WebSocket instead.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application-level errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: client sent invalid data (400)
/// - **ValidationError**: data validation failed (400)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into the JSON error body every endpoint shares:
/// `{"error": {"type", "message", "timestamp"}}`.
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let response = AppError::BadRequest("bad".to_string()).error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let response = AppError::ValidationError("invalid".to_string()).error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let response = AppError::Internal("broken".to_string()).error_response();
        assert_eq!(
            response.status(),
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_anyhow_conversion() {
        let error: AppError = anyhow::anyhow!("something failed").into();
        assert!(matches!(error, AppError::Internal(_)));
    }
}
