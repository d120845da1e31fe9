// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Connection does not own session {0}")]
    NotSessionOwner(String),

    #[error("Session not ready: {0}")]
    SessionNotReady(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation failed at {path}: {message}")]
    Validation { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotSessionOwner(_) => StatusCode::FORBIDDEN,
            AppError::SessionNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidInput(_) | AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Store(_) => "STORE_001",
            AppError::SessionNotFound(_) => "SESSION_001",
            AppError::NotSessionOwner(_) => "SESSION_002",
            AppError::SessionNotReady(_) => "SESSION_003",
            AppError::InvalidInput(_) => "VAL_001",
            AppError::Validation { .. } => "VAL_002",
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "JSON_001",
            AppError::Config(_) => "CFG_001",
            AppError::Internal(_) => "INT_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::SessionNotFound(_) => "Session not found".to_string(),
            AppError::NotSessionOwner(_) => "Not allowed for this session".to_string(),
            AppError::SessionNotReady(_) => {
                "Session is not ready yet, please try again shortly".to_string()
            },
            AppError::InvalidInput(_) | AppError::Validation { .. } => {
                "Invalid input provided".to_string()
            },
            AppError::Json(_) => "Invalid request format".to_string(),
            AppError::Store(_) | AppError::Io(_) | AppError::Config(_) | AppError::Internal(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Use detailed messages in development, sanitized in production
        let message = if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        };

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::Internal("Failed to send message".to_string())
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Internal(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}
