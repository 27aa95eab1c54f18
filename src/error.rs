//! Error types for url-dl
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (Database, Download, Broker, Storage)
//! - HTTP status code mapping for API integration
//! - Structured error responses with machine-readable error codes

use crate::types::TaskId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for url-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for url-dl
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "cron.reset_schedule")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Waiting for a task's row lock exceeded the configured bound
    #[error("timed out waiting for the lock on task {task_id}")]
    LockTimeout {
        /// The task whose lock could not be acquired
        task_id: TaskId,
    },

    /// Fetching task content failed
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Message broker error
    #[error("message broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Blob storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Caller supplied invalid input
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing, unknown or expired credentials
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Requested entity does not exist (or is not visible to the caller)
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the entity's current state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Cron schedule registration or execution error
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The application is shutting down and no longer accepts changes
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored value could not be decoded into a domain type
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Errors raised while fetching task content
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The remote server answered with a non-success status
    #[error("{url} returned HTTP {status}")]
    HttpStatus {
        /// The requested URL
        url: String,
        /// The HTTP status code received
        status: u16,
    },

    /// Connection or transfer failure
    #[error("transfer failed: {0}")]
    Transport(String),

    /// Writing the payload into blob storage failed
    #[error("failed to write payload: {0}")]
    Sink(String),

    /// No downloader exists for this download type
    #[error("unsupported download type: {0}")]
    UnsupportedType(String),
}

/// Message broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Publishing a message failed
    #[error("failed to publish to {topic}: {reason}")]
    PublishFailed {
        /// Destination topic
        topic: String,
        /// Underlying failure
        reason: String,
    },

    /// Reading messages or offsets failed
    #[error("failed to fetch from {topic}: {reason}")]
    FetchFailed {
        /// Source topic
        topic: String,
        /// Underlying failure
        reason: String,
    },

    /// Committing a consumer offset failed
    #[error("failed to commit offset {offset} on {topic}: {reason}")]
    CommitFailed {
        /// Topic the offset belongs to
        topic: String,
        /// Offset being committed
        offset: i64,
        /// Underlying failure
        reason: String,
    },

    /// A handler is already registered for this topic
    #[error("a handler is already registered for topic {0}")]
    DuplicateHandler(String),

    /// The consumer was started without any handlers
    #[error("consumer has no registered handlers")]
    NoHandlers,
}

/// Blob storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key cannot be mapped to a storage location
    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    /// No blob stored under this key
    #[error("blob {0} not found")]
    NotFound(String),

    /// Underlying storage operation failed
    #[error("blob {key}: {reason}")]
    Failed {
        /// Blob key
        key: String,
        /// Underlying failure
        reason: String,
    },
}

/// API error response format
///
/// Returned by API endpoints when an error occurs.
///
/// ```json
/// {
///   "error": {
///     "code": "not_found",
///     "message": "not found: download task 7",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "validation_error")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an "unauthorized" error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - Client error (invalid input)
            Error::Validation(_) => 400,
            Error::Download(DownloadError::UnsupportedType(_)) => 400,

            Error::Unauthenticated(_) => 401,
            Error::NotFound(_) => 404,
            Error::Storage(StorageError::NotFound(_)) => 404,
            Error::Conflict(_) => 409,

            // 500 Internal Server Error - Server-side issues
            Error::Config { .. } => 500,
            Error::Database(_) => 500,
            Error::Broker(_) => 500,
            Error::Storage(_) => 500,
            Error::Scheduler(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::ApiServerError(_) => 500,
            Error::Other(_) => 500,

            // 502 Bad Gateway - External service errors
            Error::Download(_) => 502,

            // 503 Service Unavailable - Retry later
            Error::LockTimeout { .. } => 503,
            Error::ShuttingDown => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) => "database_error",
            Error::LockTimeout { .. } => "lock_timeout",
            Error::Download(e) => match e {
                DownloadError::HttpStatus { .. } => "http_status",
                DownloadError::Transport(_) => "transport_error",
                DownloadError::Sink(_) => "sink_error",
                DownloadError::UnsupportedType(_) => "unsupported_download_type",
            },
            Error::Broker(_) => "broker_error",
            Error::Storage(StorageError::NotFound(_)) => "blob_not_found",
            Error::Storage(_) => "storage_error",
            Error::Validation(_) => "validation_error",
            Error::Unauthenticated(_) => "unauthorized",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Scheduler(_) => "scheduler_error",
            Error::Io(_) => "io_error",
            Error::ShuttingDown => "shutting_down",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();

        // Internal failures are opaque to API callers; the full error goes to the log.
        let message = if error.status_code() >= 500 && !matches!(error, Error::LockTimeout { .. })
        {
            "internal error".to_string()
        } else {
            error.to_string()
        };

        let details = match &error {
            Error::LockTimeout { task_id } => Some(serde_json::json!({
                "task_id": task_id,
            })),
            Error::Download(DownloadError::HttpStatus { url, status }) => Some(serde_json::json!({
                "url": url,
                "status": status,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
