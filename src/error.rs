//! Error types for errp-flux

use thiserror::Error;

/// Errors that can occur anywhere in the closed loop
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Archive format error: {0}")]
    FormatError(String),

    #[error("Archive header overflow: metadata is {size} bytes, header holds at most {limit}")]
    HeaderOverflowError { size: usize, limit: usize },

    #[error("Schema mismatch: {0}")]
    SchemaMismatchError(String),

    #[error("Window underrun: {available} of {required} samples buffered")]
    UnderrunError { available: usize, required: usize },

    #[error("Numerical error: {0}")]
    NumericalError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid bandit context: {0}")]
    InvalidContext(String),

    #[error("Unknown arm: {0}")]
    UnknownArm(usize),

    #[error("Session already closed")]
    SessionClosed,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl ComputeError {
    /// Errors that abort the current session without touching other sessions.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ComputeError::NumericalError(_)
                | ComputeError::FormatError(_)
                | ComputeError::HeaderOverflowError { .. }
                | ComputeError::SchemaMismatchError(_)
                | ComputeError::IoError(_)
        )
    }

    /// Errors the session loop may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ComputeError::TransportError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_invariant() {
        let err = ComputeError::HeaderOverflowError {
            size: 600,
            limit: 511,
        };
        assert_eq!(
            err.to_string(),
            "Archive header overflow: metadata is 600 bytes, header holds at most 511"
        );

        let err = ComputeError::UnderrunError {
            available: 10,
            required: 256,
        };
        assert!(err.to_string().contains("10 of 256"));
    }

    #[test]
    fn test_classification() {
        assert!(ComputeError::NumericalError("x".into()).is_session_fatal());
        assert!(!ComputeError::TransportError("x".into()).is_session_fatal());
        assert!(ComputeError::TransportError("x".into()).is_retryable());
        assert!(!ComputeError::UnknownArm(3).is_retryable());
    }
}
