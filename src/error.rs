//! Centralized error handling module
//!
//! Provides the fog node's error taxonomy and the HTTP response mapping
//! used by the status API.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Fog node error types
#[derive(Error, Debug)]
pub enum FogError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record failed field validation (dropped, never fatal)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Line could not be parsed as a JSON record (dropped, never fatal)
    #[error("Malformed record: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Device connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind ingestion listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cloud connector is not connected")]
    NotConnected,

    #[error("Cloud connection failed: {0}")]
    Connect(String),

    #[error("Cloud publish failed: {0}")]
    Publish(String),

    /// Outgoing request queue is full, the message is dropped
    #[error("Cloud publish queue full")]
    QueueFull,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Standardized error response format
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Unique correlation ID for tracing
    pub correlation_id: String,
    /// Error type classification
    pub error_type: String,
    /// Human-readable error message (safe for clients)
    pub message: String,
    /// HTTP status code
    pub status_code: u16,
    /// Timestamp of the error
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_type: &str, message: &str, status_code: StatusCode) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            status_code: status_code.as_u16(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl FogError {
    fn error_type(&self) -> &'static str {
        match self {
            FogError::Config(_) => "CONFIG_ERROR",
            FogError::Validation(_) => "VALIDATION_ERROR",
            FogError::Parse(_) => "PARSE_ERROR",
            FogError::Io(_) | FogError::Bind { .. } => "IO_ERROR",
            FogError::NotConnected
            | FogError::Connect(_)
            | FogError::Publish(_)
            | FogError::QueueFull => "CLOUD_ERROR",
            FogError::NotFound(_) => "NOT_FOUND",
            FogError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl ResponseError for FogError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let error_type = self.error_type();

        // Internal details stay in the log
        let message = match self {
            FogError::Internal(msg) => {
                error!(error = %msg, "Internal error occurred");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let error_response = ErrorResponse::new(error_type, &message, status);

        error!(
            correlation_id = %error_response.correlation_id,
            error_type = %error_type,
            status_code = %status.as_u16(),
            "Error response generated"
        );

        HttpResponse::build(status).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            FogError::Validation(_) | FogError::Parse(_) => StatusCode::BAD_REQUEST,
            FogError::NotFound(_) => StatusCode::NOT_FOUND,
            FogError::NotConnected
            | FogError::Connect(_)
            | FogError::Publish(_)
            | FogError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            FogError::Config(_)
            | FogError::Io(_)
            | FogError::Bind { .. }
            | FogError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias for fog node errors
pub type FogResult<T> = Result<T, FogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error_status() {
        let error = FogError::NotFound("device bpm-001".to_string());
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_cloud_errors_are_unavailable() {
        assert_eq!(FogError::NotConnected.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            FogError::Publish("broker rejected".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            FogError::QueueFull.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: FogError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, FogError::Parse(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_format() {
        let response = ErrorResponse::new("TEST_ERROR", "Test message", StatusCode::BAD_REQUEST);
        assert!(!response.correlation_id.is_empty());
        assert_eq!(response.error_type, "TEST_ERROR");
        assert_eq!(response.message, "Test message");
        assert_eq!(response.status_code, 400);
    }
}
