//! Cache error types

use std::time::Duration;

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Shared tier unavailable: {0}")]
    Unavailable(String),

    #[error("Shared tier call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Compute error: {0}")]
    Compute(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    /// Whether the error is a transient shared-tier failure.
    ///
    /// These are logged and degraded to a miss or a partial write, never
    /// surfaced to the operation being cached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CacheError::Redis(_) | CacheError::Unavailable(_) | CacheError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

/// Result of an operation applied to both tiers independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    /// Every tier applied the operation.
    Complete,
    /// The local tier applied the operation; the shared tier failed.
    Degraded,
}

impl TierOutcome {
    pub fn is_complete(self) -> bool {
        self == TierOutcome::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(CacheError::Timeout(Duration::from_millis(10)).is_unavailable());
        assert!(CacheError::Unavailable("down".to_owned()).is_unavailable());
        assert!(!CacheError::InvalidKey(String::new()).is_unavailable());
        assert!(!CacheError::Serialization("bad".to_owned()).is_unavailable());
    }
}
