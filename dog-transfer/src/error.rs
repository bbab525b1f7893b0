use std::time::Duration;
use thiserror::Error;

use crate::Generation;

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// How a failure should be treated by the retry policy.
///
/// Every [`TransferError`] maps to exactly one kind; the retry policy
/// dispatches on this with an exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection reset, truncated stream, timeout, 5xx. Retried.
    Transient,
    /// The service asked us to slow down. Retried with backoff.
    RateLimited,
    /// Generation/metageneration/checksum preconditions did not hold.
    Precondition,
    /// The request itself is wrong; resending it cannot succeed.
    Malformed,
    /// The object, bucket, upload or session does not exist.
    NotFound,
    /// The retry budget ran out while the failures were retryable.
    BudgetExhausted,
    /// The operation was cancelled locally.
    Cancelled,
}

/// Errors that can occur during transfer operations
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transient failure{}: {message}", fmt_status(.status))]
    Transient { status: Option<u16>, message: String },

    #[error("Request timed out: {message}")]
    Timeout { message: String },

    #[error("Rate limited (HTTP {status}): {message}")]
    RateLimited { status: u16, message: String },

    #[error("Precondition failed (HTTP {status}): {message}")]
    PreconditionFailed { status: u16, message: String },

    #[error("Object concurrently modified: expected generation {expected}, found {}", fmt_actual(.actual))]
    GenerationChanged {
        expected: Generation,
        actual: Option<Generation>,
    },

    #[error("{algorithm} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Invalid request{}: {message}", fmt_status(.status))]
    InvalidRequest { status: Option<u16>, message: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    BudgetExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        last: Box<TransferError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel is closed")]
    Closed,

    #[error("Operation not supported by this transport")]
    Unsupported,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

fn fmt_actual(actual: &Option<Generation>) -> String {
    match actual {
        Some(generation) => generation.to_string(),
        None => "a newer generation".to_string(),
    }
}

impl TransferError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            status: None,
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a transient network error
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            status: None,
            message: message.into(),
        }
    }

    /// Map an HTTP-like status code reported by the service
    pub fn from_status<S: Into<String>>(status: u16, message: S) -> Self {
        let message = message.into();
        match status {
            404 => Self::NotFound { resource: message },
            408 | 500 | 502 | 503 | 504 => Self::Transient {
                status: Some(status),
                message,
            },
            429 => Self::RateLimited { status, message },
            412 => Self::PreconditionFailed { status, message },
            _ => Self::InvalidRequest {
                status: Some(status),
                message,
            },
        }
    }

    /// Classify this error for the retry policy
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => FailureKind::Transient,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::PreconditionFailed { .. }
            | Self::GenerationChanged { .. }
            | Self::ChecksumMismatch { .. } => FailureKind::Precondition,
            Self::InvalidRequest { .. }
            | Self::Closed
            | Self::Unsupported
            | Self::Serialization { .. }
            | Self::Backend { .. } => FailureKind::Malformed,
            Self::NotFound { .. } => FailureKind::NotFound,
            Self::BudgetExhausted { .. } => FailureKind::BudgetExhausted,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Io { source } => match source.kind() {
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => {
                    FailureKind::Malformed
                }
                _ => FailureKind::Transient,
            },
        }
    }

    /// HTTP-like status code, when the service reported one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { status, .. } | Self::InvalidRequest { status, .. } => *status,
            Self::RateLimited { status, .. } | Self::PreconditionFailed { status, .. } => {
                Some(*status)
            }
            Self::NotFound { .. } => Some(404),
            Self::Timeout { .. } => Some(408),
            _ => None,
        }
    }

    /// Check if this error may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::Transient | FailureKind::RateLimited
        )
    }

    /// Check if the referenced resource does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == FailureKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(TransferError::from_status(404, "x").kind(), FailureKind::NotFound);
        assert_eq!(TransferError::from_status(503, "x").kind(), FailureKind::Transient);
        assert_eq!(TransferError::from_status(408, "x").kind(), FailureKind::Transient);
        assert_eq!(TransferError::from_status(429, "x").kind(), FailureKind::RateLimited);
        assert_eq!(TransferError::from_status(412, "x").kind(), FailureKind::Precondition);
        assert_eq!(TransferError::from_status(400, "x").kind(), FailureKind::Malformed);
        assert_eq!(TransferError::from_status(416, "x").status(), Some(416));
    }

    #[test]
    fn io_errors_are_transient_unless_data_is_bad() {
        let reset = TransferError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(reset.is_retryable());

        let corrupt = TransferError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad gzip",
        ));
        assert_eq!(corrupt.kind(), FailureKind::Malformed);
    }

    #[test]
    fn exhausted_budget_is_distinguishable_from_rejection() {
        let exhausted = TransferError::BudgetExhausted {
            attempts: 3,
            elapsed: Duration::from_millis(10),
            last: Box::new(TransferError::transient("reset")),
        };
        assert_eq!(exhausted.kind(), FailureKind::BudgetExhausted);
        assert!(!exhausted.is_retryable());
        assert!(exhausted.to_string().contains("3 attempts"));
    }

    #[test]
    fn generation_change_message() {
        let err = TransferError::GenerationChanged {
            expected: Generation::from("7"),
            actual: None,
        };
        assert!(err.to_string().contains("concurrently modified"));
        assert_eq!(err.kind(), FailureKind::Precondition);
    }
}
