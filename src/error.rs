//! Error types for the shard router.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Each variant maps to one stable, documented response at the HTTP boundary, and the
//! messages are written so an operator can act on them without seeing internal state.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("{resource} '{key}' already exists")]
    AlreadyExists { resource: String, key: String },

    #[error("{resource} '{key}' not found")]
    NotFound { resource: String, key: String },

    #[error("Forbidden: {operation} - {reason}")]
    Forbidden { operation: String, reason: String },

    #[error("Provisioning failed: {message}")]
    ProvisioningFailed { message: String, suggestion: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The shard's pool or cache was closed or could not hand out a connection in time.
    #[error("Unavailable: {message}")]
    Unavailable { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
    },

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ShardError {
    /// Create an already-exists error for a shard, cache binding or record.
    pub fn already_exists(resource: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
            key: key.into(),
        }
    }

    /// Create a not-found error for a shard, cache binding or record.
    pub fn not_found(resource: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            key: key.into(),
        }
    }

    /// Create a forbidden error.
    pub fn forbidden(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Forbidden {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a provisioning error with a helpful suggestion.
    pub fn provisioning(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ProvisioningFailed {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an unavailable error with a helpful suggestion.
    pub fn unavailable(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ProvisioningFailed { suggestion, .. } => Some(suggestion),
            Self::Unavailable { suggestion, .. } => Some(suggestion),
            Self::Forbidden { .. } => Some("The default shard is permanent; operate on another key"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProvisioningFailed { .. } | Self::Unavailable { .. }
        )
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists { .. } => "already_exists",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::ProvisioningFailed { .. } => "provisioning_failed",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Unavailable { .. } => "unavailable",
            Self::Database { .. } => "database_error",
            Self::Cache { .. } => "cache_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyExists { .. } => StatusCode::CONFLICT,
            Self::ProvisioningFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database { .. } | Self::Cache { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Convert sqlx errors raised by data operations to ShardError.
///
/// Connection failures while building a pool are reported by the pool factory as
/// `ProvisioningFailed`; this conversion covers errors on an already published pool.
impl From<sqlx::Error> for ShardError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => ShardError::invalid_argument(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                ShardError::database(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => ShardError::not_found("row", "query"),
            sqlx::Error::PoolTimedOut => ShardError::unavailable(
                "Timed out waiting for a pooled connection",
                "Raise max_active or max_wait for this shard",
            ),
            sqlx::Error::PoolClosed => ShardError::unavailable(
                "Connection pool is closed",
                "The shard was removed; resolve it again or pick another shard",
            ),
            sqlx::Error::Io(io_err) => ShardError::unavailable(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => ShardError::unavailable(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                ShardError::database(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                ShardError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => ShardError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => ShardError::internal("Database worker crashed"),
            _ => ShardError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Convert redis errors to ShardError.
impl From<redis::RedisError> for ShardError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_timeout() || err.is_io_error() {
            ShardError::unavailable(
                format!("Cache unreachable: {}", err),
                "Check that the cache server is running and accessible",
            )
        } else {
            ShardError::cache(err.to_string())
        }
    }
}

/// Result type alias for shard operations.
pub type ShardResult<T> = Result<T, ShardError>;

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
}

impl IntoResponse for ShardError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Unexpected errors only expose a generic message.
        let message = match &self {
            ShardError::Internal { .. } => "Internal error while handling the request".to_string(),
            _ => self.to_string(),
        };
        let body = ErrorBody {
            success: false,
            code: self.code(),
            message,
            suggestion: self.suggestion().map(String::from),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShardError::already_exists("shard", "east");
        assert_eq!(err.to_string(), "shard 'east' already exists");

        let err = ShardError::not_found("cache binding", "west");
        assert_eq!(err.to_string(), "cache binding 'west' not found");
    }

    #[test]
    fn test_error_suggestion() {
        let err = ShardError::provisioning("connect refused", "Check the server");
        assert_eq!(err.suggestion(), Some("Check the server"));
        assert!(ShardError::invalid_argument("x").suggestion().is_none());
    }

    #[test]
    fn test_error_retryable() {
        assert!(ShardError::provisioning("a", "b").is_retryable());
        assert!(ShardError::unavailable("a", "b").is_retryable());
        assert!(!ShardError::forbidden("remove shard", "default").is_retryable());
        assert!(!ShardError::not_found("shard", "x").is_retryable());
    }

    #[test]
    fn test_each_kind_has_distinct_status() {
        let errors = [
            ShardError::invalid_argument("x"),
            ShardError::forbidden("op", "why"),
            ShardError::not_found("shard", "k"),
            ShardError::already_exists("shard", "k"),
            ShardError::provisioning("m", "s"),
            ShardError::unavailable("m", "s"),
        ];
        let mut statuses: Vec<u16> = errors.iter().map(|e| e.status_code().as_u16()).collect();
        statuses.sort_unstable();
        statuses.dedup();
        assert_eq!(statuses.len(), errors.len());
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ShardError::already_exists("shard", "k").code(), "already_exists");
        assert_eq!(ShardError::not_found("shard", "k").code(), "not_found");
        assert_eq!(ShardError::forbidden("op", "r").code(), "forbidden");
        assert_eq!(ShardError::provisioning("m", "s").code(), "provisioning_failed");
        assert_eq!(ShardError::invalid_argument("m").code(), "invalid_argument");
    }

    #[test]
    fn test_pool_closed_maps_to_unavailable() {
        let err: ShardError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, ShardError::Unavailable { .. }));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_internal_error_response_hides_details() {
        let response = ShardError::internal("lock poisoned at registry.rs:42").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
