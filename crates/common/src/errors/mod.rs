//! Error types for ScopeRAG services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling
//!
//! Expected absence-of-data conditions (missing collection, no hits,
//! unreachable backend with a usable fallback) are not errors; they travel
//! as structured outcomes from the search crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scope::UnknownSelector;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    InvalidScope,
    InvalidSource,
    EmptyQuestion,

    // Rate limiting (6xxx)
    RateLimited,

    // External service errors (8xxx)
    EmbeddingError,
    EmbeddingTimeout,
    EmbeddingUnavailable,
    LlmError,
    RetrievalTimeout,

    // Internal errors (9xxx)
    ConfigurationError,
    DimensionMismatch,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidScope => 1002,
            ErrorCode::InvalidSource => 1003,
            ErrorCode::EmptyQuestion => 1004,

            ErrorCode::RateLimited => 6001,

            ErrorCode::EmbeddingError => 8002,
            ErrorCode::EmbeddingTimeout => 8003,
            ErrorCode::EmbeddingUnavailable => 8004,
            ErrorCode::LlmError => 8005,
            ErrorCode::RetrievalTimeout => 8006,

            ErrorCode::ConfigurationError => 9002,
            ErrorCode::DimensionMismatch => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>
    },

    #[error("Invalid scope '{value}': expected 'personal' or 'dept'")]
    InvalidScope { value: String },

    #[error("Invalid source '{value}': expected 'mail' or 'doc'")]
    InvalidSource { value: String },

    #[error("Question is empty")]
    EmptyQuestion,

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // External service errors
    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("Embedding timeout after {timeout_ms}ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    /// Connection failure or 5xx from the embedding service; worth retrying
    #[error("Embedding service unavailable: {message}")]
    EmbeddingUnavailable { message: String },

    #[error("LLM error: {message}")]
    LlmError { message: String },

    #[error("Retrieval did not finish within {timeout_ms}ms")]
    RetrievalTimeout { timeout_ms: u64 },

    // Internal errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error(
        "Embedding dimension mismatch: collection '{collection}' on {scope} stores {stored}-d vectors, \
         model '{model}' produces {produced}-d vectors"
    )]
    DimensionMismatch {
        scope: String,
        collection: String,
        model: String,
        stored: usize,
        produced: usize,
    },
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::InvalidScope { .. } => ErrorCode::InvalidScope,
            AppError::InvalidSource { .. } => ErrorCode::InvalidSource,
            AppError::EmptyQuestion => ErrorCode::EmptyQuestion,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::EmbeddingTimeout { .. } => ErrorCode::EmbeddingTimeout,
            AppError::EmbeddingUnavailable { .. } => ErrorCode::EmbeddingUnavailable,
            AppError::LlmError { .. } => ErrorCode::LlmError,
            AppError::RetrievalTimeout { .. } => ErrorCode::RetrievalTimeout,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } |
            AppError::InvalidScope { .. } |
            AppError::InvalidSource { .. } |
            AppError::EmptyQuestion => StatusCode::BAD_REQUEST,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Configuration { .. } |
            AppError::DimensionMismatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::EmbeddingError { .. } |
            AppError::EmbeddingTimeout { .. } |
            AppError::LlmError { .. } => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            AppError::RetrievalTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            // 503 Service Unavailable
            AppError::EmbeddingUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether repeating the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::EmbeddingTimeout { .. } | AppError::EmbeddingUnavailable { .. }
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let details = match &self {
            AppError::Validation { field: Some(field), .. } => {
                Some(serde_json::json!({ "field": field }))
            }
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<UnknownSelector> for AppError {
    fn from(err: UnknownSelector) -> Self {
        match err.kind {
            "scope" => AppError::InvalidScope { value: err.value },
            _ => AppError::InvalidSource { value: err.value },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{ScopeSelector, SourceType};

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::InvalidScope { value: "team".into() };
        assert_eq!(err.code(), ErrorCode::InvalidScope);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code().as_code(), 1002);
    }

    #[test]
    fn test_selector_errors_convert() {
        let err: AppError = "team".parse::<ScopeSelector>().unwrap_err().into();
        assert!(matches!(err, AppError::InvalidScope { ref value } if value == "team"));

        let err: AppError = "pdf".parse::<SourceType>().unwrap_err().into();
        assert!(matches!(err, AppError::InvalidSource { ref value } if value == "pdf"));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_server_error() {
        let err = AppError::DimensionMismatch {
            scope: "personal".into(),
            collection: "personal_dev_mail_my_documents".into(),
            model: "bge-m3".into(),
            stored: 768,
            produced: 1024,
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.is_server_error());
        assert!(err.to_string().contains("768-d"));
    }

    #[test]
    fn test_upstream_errors_are_gateway_errors() {
        let err = AppError::LlmError { message: "connection refused".into() };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        let err = AppError::EmbeddingUnavailable { message: "503 Service Unavailable".into() };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_transient());
        assert!(!AppError::EmbeddingError { message: "401".into() }.is_transient());
    }
}
