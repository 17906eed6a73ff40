//! Domain error types shared by the branch manager, revision store, commit
//! coordinator, compare engine and merge processor.

use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced to callers of the branching store.
///
/// Messages name branch paths and object identifiers, never index keys.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A branch or object does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A branch path is already taken (including by a deleted branch).
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Malformed input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The write lock for a branch could not be acquired in time.
    #[error("timed out after {}ms waiting for write lock on {}", .waited.as_millis(), .paths.join(", "))]
    LockTimeout { paths: Vec<String>, waited: Duration },

    /// The operation cannot be applied automatically.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The underlying index failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StorageError),

    /// The caller cancelled a long-running operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A pre-commit hook refused the change set.
    #[error("commit to {branch} rejected: {reason}")]
    Rejected { branch: String, reason: String },
}

impl StoreError {
    pub fn branch_not_found(path: impl ToString) -> Self {
        StoreError::NotFound {
            kind: "branch",
            id: path.to_string(),
        }
    }

    pub fn object_not_found(object: impl ToString) -> Self {
        StoreError::NotFound {
            kind: "object",
            id: object.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::AlreadyExists { .. })
    }

    /// Check if the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::LockTimeout { .. } => true,
            StoreError::StoreUnavailable(e) => e.is_retriable(),
            _ => false,
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::StoreUnavailable(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let timeout = StoreError::LockTimeout {
            paths: vec!["MAIN/task1".to_string()],
            waited: Duration::from_millis(250),
        };
        assert!(timeout.is_retryable());
        assert_eq!(
            timeout.to_string(),
            "timed out after 250ms waiting for write lock on MAIN/task1"
        );

        assert!(!StoreError::branch_not_found("MAIN/x").is_retryable());
        assert!(!StoreError::Conflict("duplicate".to_string()).is_retryable());
        assert!(StoreError::from(StorageError::Unavailable("down".to_string())).is_retryable());
        assert!(!StoreError::from(StorageError::Internal("bug".to_string())).is_retryable());
    }

    #[test]
    fn test_error_classification() {
        let missing = StoreError::branch_not_found("MAIN/x");
        assert!(missing.is_not_found());
        assert_eq!(missing.to_string(), "branch not found: MAIN/x");

        let exists = StoreError::AlreadyExists {
            kind: "branch",
            id: "MAIN/a".to_string(),
        };
        assert!(exists.is_conflict());
        assert!(!exists.is_not_found());
    }
}
