//! Error taxonomy for the pipeline
//!
//! Every failure is classified into one of four classes. The class, never a
//! diagnosis, drives retry, isolation, abort and circuit-breaker decisions.

use serde::{Deserialize, Serialize};

/// Error classes, ordered by how far they propagate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network/timeout - retry with backoff, bounded attempts
    Transient,
    /// One opportunity or order failed - isolate and continue
    ItemLevel,
    /// Abort the remaining sequence for this cycle, future cycles allowed
    Systemic,
    /// Store corruption, audit failure - counts toward the circuit breaker
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::ItemLevel => "item_level",
            ErrorClass::Systemic => "systemic",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "item_level" => Ok(ErrorClass::ItemLevel),
            "systemic" => Ok(ErrorClass::Systemic),
            "fatal" => Ok(ErrorClass::Fatal),
            other => Err(StoreError::Corrupt(format!("unknown error class '{}'", other))),
        }
    }
}

/// Durable store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O level problem; the caller may retry
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Integrity or schema problem; never retried
    #[error("store corrupt: {0}")]
    Corrupt(String),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StoreError::Corrupt(err.to_string())
                }
                _ => StoreError::Unavailable(err.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(err.to_string()),
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::InvalidColumnIndex(_)
            | rusqlite::Error::InvalidColumnName(_) => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Pipeline errors raised by phases and collaborators
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("transient failure in {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("{operation} rejected: {message}")]
    Rejected { operation: String, message: String },

    #[error("{operation} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("audit failed: {0}")]
    Audit(String),

    #[error("risk veto: {0}")]
    RiskVeto(String),

    #[error("invalid phase transition: {0}")]
    InvalidTransition(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The venue confirmed a fill the journal could not record
    #[error("fill for order {order_id} not persisted: {message}")]
    Unsettled { order_id: uuid::Uuid, message: String },
}

impl PipelineError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Rejected {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Map an HTTP client error onto the taxonomy
    ///
    /// Timeouts, connection failures and 5xx responses are transient;
    /// 4xx responses are terminal rejections for the item.
    pub fn from_reqwest(operation: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return PipelineError::transient(operation, err.to_string());
        }
        match err.status() {
            Some(status) if status.is_client_error() => {
                PipelineError::rejected(operation, err.to_string())
            }
            _ => PipelineError::transient(operation, err.to_string()),
        }
    }

    /// Classify the error. Severity is a property of the error kind only.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Store(e) if e.is_retryable() => ErrorClass::Transient,
            PipelineError::Store(_) => ErrorClass::Fatal,
            PipelineError::Transient { .. } => ErrorClass::Transient,
            PipelineError::Rejected { .. } => ErrorClass::ItemLevel,
            PipelineError::RetriesExhausted { .. } => ErrorClass::Systemic,
            PipelineError::Audit(_) => ErrorClass::Systemic,
            PipelineError::RiskVeto(_) => ErrorClass::Systemic,
            PipelineError::InvalidTransition(_) => ErrorClass::Fatal,
            PipelineError::Invariant(_) => ErrorClass::Fatal,
            PipelineError::Unsettled { .. } => ErrorClass::Fatal,
        }
    }

    /// Errors that open the breaker on first sight instead of counting toward it
    pub fn trips_breaker(&self) -> bool {
        matches!(self, PipelineError::Unsettled { .. })
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
