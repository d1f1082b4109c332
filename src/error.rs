//! Error types for splitsight

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type alias for splitsight operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for splitsight
#[derive(Debug)]
pub enum Error {
    /// Backend unreachable or credentials expired (retryable)
    Connection(String),
    /// Generated query rejected by the backend (not retryable)
    QuerySyntax(String),
    /// Backend lacks a capability the analysis needs (not retryable)
    Unsupported { backend: String, operation: String },
    /// Query stopped heart-beating and was reclassified as failed (retryable)
    StaleQuery(String),
    /// Object store errors
    ObjectStore(object_store::Error),
    /// DataFusion errors
    DataFusion(datafusion::error::DataFusionError),
    /// Arrow errors
    Arrow(arrow::error::ArrowError),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Metadata store error
    Metadata(String),
    /// Document not found
    NotFound { collection: &'static str, id: String },
    /// Stale document version (optimistic concurrency)
    StaleVersion { expected: u64, actual: u64 },
    /// Metadata conflict (CAS failure)
    Conflict,
    /// Too many retries
    TooManyRetries,
    /// Invalid request
    InvalidRequest(String),
    /// Job queue error
    Queue(String),
    /// Timeout
    Timeout,
    /// Internal error
    Internal(String),
}

/// Persisted classification of a query failure.
///
/// Stored on query records so that readers in other processes can rebuild
/// the taxonomy without the original error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    QuerySyntax,
    Unsupported,
    StaleQuery,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::QuerySyntax => "query_syntax",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::StaleQuery => "stale_query",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::StaleQuery)
    }
}

impl Error {
    /// Classify this error for persistence on a query record.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) | Error::Timeout => ErrorKind::Connection,
            Error::QuerySyntax(_) | Error::DataFusion(_) => ErrorKind::QuerySyntax,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::StaleQuery(_) => ErrorKind::StaleQuery,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Rebuild a typed error from a persisted kind and message.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Connection => Error::Connection(message),
            ErrorKind::QuerySyntax => Error::QuerySyntax(message),
            ErrorKind::Unsupported => Error::Unsupported {
                backend: "unknown".to_string(),
                operation: message,
            },
            ErrorKind::StaleQuery => Error::StaleQuery(message),
            ErrorKind::Internal => Error::Internal(message),
        }
    }

    pub fn unsupported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::Unsupported {
            backend: backend.into(),
            operation: operation.into(),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::DataFusion(e) => Some(e),
            Error::Arrow(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(msg) => write!(f, "Connection error: {}", msg),
            Error::QuerySyntax(msg) => write!(f, "Query syntax error: {}", msg),
            Error::Unsupported { backend, operation } => {
                write!(f, "{} is not implemented for the {} backend", operation, backend)
            }
            Error::StaleQuery(msg) => write!(f, "Stale query: {}", msg),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::DataFusion(e) => write!(f, "DataFusion error: {}", e),
            Error::Arrow(e) => write!(f, "Arrow error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Metadata(msg) => write!(f, "Metadata error: {}", msg),
            Error::NotFound { collection, id } => write!(f, "{} {} not found", collection, id),
            Error::StaleVersion { expected, actual } => {
                write!(f, "Stale version: expected {}, got {}", expected, actual)
            }
            Error::Conflict => write!(f, "Metadata conflict: concurrent modification detected"),
            Error::TooManyRetries => write!(
                f,
                "Too many retries: operation failed after maximum retry attempts"
            ),
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Error::Queue(msg) => write!(f, "Job queue error: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<datafusion::error::DataFusionError> for Error {
    fn from(e: datafusion::error::DataFusionError) -> Self {
        Error::DataFusion(e)
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        Error::Arrow(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::Connection(e.to_string()),
            sqlx::Error::Database(db) => {
                // SQLSTATE class 08 is connection exception, 28 is invalid authorization
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                if code.starts_with("08") || code.starts_with("28") {
                    Error::Connection(db.to_string())
                } else {
                    Error::QuerySyntax(db.to_string())
                }
            }
            _ => Error::Internal(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            Error::Connection(e.to_string())
        } else if e.is_decode() {
            Error::Serialization(e.to_string())
        } else {
            Error::Internal(e.to_string())
        }
    }
}
