use thiserror::Error;

/// Errors from repository operations (used by trait definitions in flowkeep-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// Stored data failed an integrity check and cannot be trusted.
    #[error("corrupted record: {0}")]
    Corrupted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_conflict_and_corrupted_display() {
        let err = RepositoryError::Conflict("stale sequence 3".to_string());
        assert_eq!(err.to_string(), "conflict: stale sequence 3");

        let err = RepositoryError::Corrupted("digest mismatch".to_string());
        assert!(err.to_string().contains("digest mismatch"));
    }
}
