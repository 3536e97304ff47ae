use chrono::{DateTime, Utc};
use thiserror::Error;

/// Stable error kinds exposed by every public operation.
///
/// Kinds are part of the public contract; callers may match on them to
/// decide whether to retry, surface, or drop an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Input failed validation before any write reached the database
    ConstraintViolation,
    /// The database returned an error while running a statement
    QueryFailed,
    /// A transaction could not commit; all effects were rolled back
    TransactionFailed,
    /// A schema change was refused (duplicate version, checksum drift, failed action)
    MigrationFailed,
    /// A handle could not be established or validated
    ConnectionFailed,
    /// Pool acquisition timed out or a cache hit a hard cap
    ResourceExhausted,
    /// An operation exceeded its timeout budget
    Timeout,
    /// Invalid configuration or missing required options
    Configuration,
}

impl ErrorKind {
    /// Short machine code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ConstraintViolation => "CONSTRAINT_VIOLATION",
            ErrorKind::QueryFailed => "QUERY_FAILED",
            ErrorKind::TransactionFailed => "TRANSACTION_FAILED",
            ErrorKind::MigrationFailed => "MIGRATION_FAILED",
            ErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Configuration => "CONFIGURATION",
        }
    }

    /// Whether errors of this kind are safe to retry without caller changes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ConnectionFailed
                | ErrorKind::ResourceExhausted
                | ErrorKind::TransactionFailed
        )
    }
}

/// A sanitized description of the statement that produced an error.
///
/// Only the leading SQL keyword and the parameter count are retained;
/// raw SQL text and user-supplied values never leave the engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatementSummary {
    pub verb: String,
    pub param_count: usize,
}

impl StatementSummary {
    pub fn of(sql: &str, param_count: usize) -> Self {
        let verb = sql
            .split_whitespace()
            .next()
            .unwrap_or("UNKNOWN")
            .to_ascii_uppercase();
        Self { verb, param_count }
    }
}

impl std::fmt::Display for StatementSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} params)", self.verb, self.param_count)
    }
}

/// Errors produced by the storage engine.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Constraint violation: {message}")]
    ConstraintViolation { message: String },

    #[error("Query failed: {message}")]
    QueryFailed {
        message: String,
        statement: Option<StatementSummary>,
        timestamp: DateTime<Utc>,
    },

    #[error("Transaction failed: {message}")]
    TransactionFailed {
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[error("Migration failed: {message}")]
    MigrationFailed {
        message: String,
        version: Option<i64>,
    },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Resource exhausted: {message}")]
    ResourceExhausted {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Operation timed out: {operation_type} exceeded {timeout_ms}ms (elapsed {elapsed_ms}ms)")]
    Timeout {
        operation_type: String,
        timeout_ms: u64,
        elapsed_ms: u64,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl StoreError {
    /// Builds a `ConstraintViolation`. Also serves as the `Validation` alias
    /// used by builders and search parameter checks.
    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::ConstraintViolation {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        StoreError::Configuration {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        StoreError::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn migration(message: impl Into<String>, version: Option<i64>) -> Self {
        StoreError::MigrationFailed {
            message: message.into(),
            version,
        }
    }

    pub fn resource_exhausted(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        StoreError::ResourceExhausted {
            message: message.into(),
            retry_after_ms,
        }
    }

    /// Wraps a database failure with a sanitized statement summary.
    pub fn query(err: rusqlite::Error, sql: &str, param_count: usize) -> Self {
        StoreError::QueryFailed {
            message: err.to_string(),
            statement: Some(StatementSummary::of(sql, param_count)),
            timestamp: Utc::now(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        StoreError::TransactionFailed {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn timeout(operation_type: impl Into<String>, timeout_ms: u64, elapsed_ms: u64) -> Self {
        StoreError::Timeout {
            operation_type: operation_type.into(),
            timeout_ms,
            elapsed_ms,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            StoreError::QueryFailed { .. } => ErrorKind::QueryFailed,
            StoreError::TransactionFailed { .. } => ErrorKind::TransactionFailed,
            StoreError::MigrationFailed { .. } => ErrorKind::MigrationFailed,
            StoreError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            StoreError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            StoreError::Timeout { .. } => ErrorKind::Timeout,
            StoreError::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Hint for callers that want to back off before retrying.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            StoreError::ResourceExhausted { retry_after_ms, .. } => *retry_after_ms,
            StoreError::Timeout { timeout_ms, .. } => Some(*timeout_ms / 2),
            _ => None,
        }
    }

    /// Whether the error is retryable, from its kind or a message keyword.
    pub fn is_retryable(&self) -> bool {
        if self.kind().is_retryable() {
            return true;
        }
        let message = self.to_string().to_ascii_lowercase();
        ["timeout", "connection", "network", "transient", "busy", "locked"]
            .iter()
            .any(|kw| message.contains(kw))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StoreError::ResourceExhausted {
                    message: err.to_string(),
                    retry_after_ms: Some(100),
                }
            }
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::CannotOpen
                    || code.code == rusqlite::ErrorCode::NotADatabase =>
            {
                StoreError::ConnectionFailed {
                    message: err.to_string(),
                }
            }
            _ => StoreError::QueryFailed {
                message: err.to_string(),
                statement: None,
                timestamp: Utc::now(),
            },
        }
    }
}

/// Result type alias using the engine's error type
pub type Result<T> = std::result::Result<T, StoreError>;
