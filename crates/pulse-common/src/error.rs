//! Error types and result handling for the Pulsewatch pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Pool acquire timed out: {0}")]
    PoolTimeout(String),

    #[error("Pool is shutting down")]
    ShuttingDown,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl Error {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout(_)
                | Error::UpstreamUnavailable(_)
                | Error::RateLimited(_)
                | Error::PoolTimeout(_)
        )
    }

    /// Stable code reported at the wire boundary
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) => ErrorCode::SchemaValidationFailed,
            Error::InsufficientData(_) => ErrorCode::InsufficientData,
            Error::UpstreamUnavailable(_) => ErrorCode::UpstreamUnavailable,
            Error::RateLimited(_) => ErrorCode::RateLimited,
            Error::Timeout(_) | Error::PoolTimeout(_) => ErrorCode::Timeout,
            _ => ErrorCode::InternalError,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Storage(_) => "storage",
            Error::PoolTimeout(_) => "pool",
            Error::ShuttingDown => "pool",
            Error::Validation(_) => "validation",
            Error::InsufficientData(_) => "forecast",
            Error::UpstreamUnavailable(_) => "upstream",
            Error::RateLimited(_) => "rate_limit",
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::NotFound(_) => "not_found",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
            Error::Generic(_) => "generic",
        }
    }
}

/// Stable item- and request-level codes exposed at the wire boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMetricKey,
    InvalidValue,
    InvalidTimestamp,
    InvalidDimensions,
    SchemaValidationFailed,
    DuplicateIdempotencyKey,
    RateLimited,
    InsufficientData,
    InvalidConfidence,
    UpstreamUnavailable,
    Timeout,
    InternalError,
}

impl ErrorCode {
    /// Whether a caller may usefully retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::UpstreamUnavailable | ErrorCode::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMetricKey => "invalid_metric_key",
            ErrorCode::InvalidValue => "invalid_value",
            ErrorCode::InvalidTimestamp => "invalid_timestamp",
            ErrorCode::InvalidDimensions => "invalid_dimensions",
            ErrorCode::SchemaValidationFailed => "schema_validation_failed",
            ErrorCode::DuplicateIdempotencyKey => "duplicate_idempotency_key",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::InsufficientData => "insufficient_data",
            ErrorCode::InvalidConfidence => "invalid_confidence",
            ErrorCode::UpstreamUnavailable => "upstream_unavailable",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Network("connection reset".into()).is_retryable());
        assert!(Error::Timeout("slow upstream".into()).is_retryable());
        assert!(Error::UpstreamUnavailable("breaker open".into()).is_retryable());
        assert!(!Error::Validation("bad key".into()).is_retryable());
        assert!(!Error::InsufficientData("2 points".into()).is_retryable());
    }

    #[test]
    fn wire_codes_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorCode::InvalidMetricKey).unwrap();
        assert_eq!(json, "\"invalid_metric_key\"");
        let code: ErrorCode = serde_json::from_str("\"upstream_unavailable\"").unwrap();
        assert_eq!(code, ErrorCode::UpstreamUnavailable);
    }

    #[test]
    fn breaker_open_maps_to_upstream_unavailable() {
        let err = Error::UpstreamUnavailable("circuit open".into());
        assert_eq!(err.wire_code(), ErrorCode::UpstreamUnavailable);
        assert!(err.wire_code().is_retryable());
    }
}
