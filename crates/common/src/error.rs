//! Common error types for ChatServe
//!
//! This module defines all error types used across the ChatServe system.
//! All errors are convertible to HTTP responses for proper error propagation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Main error type for ChatServe
#[derive(Error, Debug)]
pub enum ChatServeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration source errors (file parsing, env overrides)
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    /// Model or tokenizer artifacts missing, corrupt or unplaceable
    #[error("Load error: {0}")]
    Load(String),

    /// Request body rejected before any model work
    #[error("Validation error: {0}")]
    Validation(String),

    /// Failure while encoding, generating or decoding
    #[error("Generation error: {0}")]
    Generation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatServeError {
    /// HTTP status code reported to callers for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatServeError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChatServeError::Config(_)
            | ChatServeError::ConfigSource(_)
            | ChatServeError::Load(_)
            | ChatServeError::Generation(_)
            | ChatServeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ChatServeError::Config(msg.into())
    }

    /// Create a load error
    pub fn load(msg: impl Into<String>) -> Self {
        ChatServeError::Load(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatServeError::Validation(msg.into())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        ChatServeError::Generation(msg.into())
    }
}

impl IntoResponse for ChatServeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = match &self {
            ChatServeError::Validation(_) => self.to_string(),
            _ => "Internal server error".to_string(),
        };
        let body = Json(serde_json::json!({ "detail": detail }));
        (status, body).into_response()
    }
}

/// Result type alias for ChatServe operations
pub type Result<T> = std::result::Result<T, ChatServeError>;
