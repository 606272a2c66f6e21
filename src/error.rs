//! Error types for campus-recommender

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecommendError {
    #[error("Invalid behavior kind: {0}")]
    InvalidBehaviorKind(String),

    #[error("Invalid behavior weight: {0}")]
    InvalidBehaviorWeight(String),

    #[error("Unknown feature key: {0}")]
    UnknownFeatureKey(String),

    #[error("Invalid value for feature '{key}': {reason}")]
    InvalidFeatureValue { key: String, reason: String },

    #[error("Candidate source unavailable: {0}")]
    CandidateSourceUnavailable(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecommendError {
    /// Dependency faults that a caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecommendError::CandidateSourceUnavailable(_))
    }

    /// Validation failures caused by the request itself
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            RecommendError::InvalidBehaviorKind(_)
                | RecommendError::InvalidBehaviorWeight(_)
                | RecommendError::UnknownFeatureKey(_)
                | RecommendError::InvalidFeatureValue { .. }
                | RecommendError::InvalidStatusTransition { .. }
        )
    }
}

pub type Result<T, E = RecommendError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_candidate_source_is_retryable() {
        assert!(RecommendError::CandidateSourceUnavailable("timeout".into()).is_retryable());
        assert!(!RecommendError::NotFound("rec 1".into()).is_retryable());
        assert!(!RecommendError::Forbidden("rec 1".into()).is_retryable());
    }

    #[test]
    fn test_validation_errors_are_caller_faults() {
        assert!(RecommendError::InvalidBehaviorKind("poke".into()).is_caller_fault());
        assert!(RecommendError::UnknownFeatureKey("shoe_size".into()).is_caller_fault());
        assert!(RecommendError::InvalidStatusTransition {
            from: "applied".into(),
            to: "dismissed".into(),
        }
        .is_caller_fault());
        assert!(!RecommendError::CandidateSourceUnavailable("down".into()).is_caller_fault());
    }
}
