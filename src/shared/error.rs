//! Application Error Types
//!
//! Centralized error handling with Axum integration, plus the error
//! taxonomy of the routing core (cache, presence, bus, startup).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// HTTP-facing application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, 10002, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, 10008, msg.clone()),
        };

        (status, Json(ErrorResponse { code, message })).into_response()
    }
}

/// Key/value cache backend failure
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Presence store failure
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Presence entry encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A partial-key lookup matched more than one key.
    #[error("Lookup for '{pattern}' matched {matches} keys")]
    Ambiguous { pattern: String, matches: usize },
}

/// Message bus failure
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Bus operation timed out: {0}")]
    Timeout(&'static str),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Bus client is closed")]
    Closed,

    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

/// Fatal error while bringing the process up
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Cannot reach {dependency} after {attempts} attempts: {reason}")]
    Unreachable {
        dependency: &'static str,
        attempts: u32,
        reason: String,
    },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Lifecycle cannot start from state {0:?}")]
    InvalidState(crate::lifecycle::LifecycleState),
}
