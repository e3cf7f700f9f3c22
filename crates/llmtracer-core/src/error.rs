//! Error types for the tracing service

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the service's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for service operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The backing store could not serve the request
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record, e.g. `Trace`
        entity: String,
        /// Id that was looked up
        id: String,
    },

    /// Missing or unknown API key
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// The caller's project does not own the record
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry in {}ms", retry_after.as_millis())]
    RateLimited {
        /// Time until the caller's window admits another request
        retry_after: Duration,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code reported to API callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Database(_) | Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Config(_)
            | Self::Internal(_)
            | Self::Io(_)
            | Self::Serialization(_) => "internal_error",
        }
    }

    /// Whether a caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Database(_) | Self::StorageUnavailable(_)
        )
    }
}
