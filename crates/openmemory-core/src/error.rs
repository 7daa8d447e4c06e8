//! Engine error type
//!
//! Every kind maps to a stable machine-readable code; messages stay short
//! and never carry stack traces to callers.

use crate::store::StoreError;

/// Errors surfaced by the engine facade
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad input from the caller
    #[error("validation failed: {0}")]
    Validation(String),
    /// Unknown id, or the id belongs to a different user
    #[error("not found: {0}")]
    NotFound(String),
    /// The embedding provider failed on the query path
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    /// A deadline elapsed
    #[error("operation timed out")]
    Timeout,
    /// Backpressure: the embedding queue is at its high-water mark
    #[error("engine busy, retry later")]
    Busy,
    /// The underlying store failed
    #[error("storage fault: {0}")]
    Storage(#[from] StoreError),
    /// A versioned update lost the race twice
    #[error("conflict: concurrent update on {0}")]
    Conflict(String),
    /// An engine invariant broke; fatal for the affected request
    #[error("internal invariant broken: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::EmbeddingFailed(_) => "embedding_failed",
            EngineError::Timeout => "timeout",
            EngineError::Busy => "busy",
            EngineError::Storage(_) => "storage_fault",
            EngineError::Conflict(_) => "conflict",
            EngineError::Internal(_) => "internal",
        }
    }
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).code(), "validation");
        assert_eq!(EngineError::NotFound("x".into()).code(), "not_found");
        assert_eq!(EngineError::Timeout.code(), "timeout");
        assert_eq!(EngineError::Busy.code(), "busy");
        assert_eq!(EngineError::Conflict("x".into()).code(), "conflict");
    }

    #[test]
    fn test_messages_are_short() {
        let err = EngineError::Validation("content must not be empty".into());
        assert!(err.to_string().len() < 120);
    }
}
