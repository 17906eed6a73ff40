//! Storage layer error types
//!
//! All errors that can occur inside a document index are defined here.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::{CollectionName, DocKey, InvalidNameError};

/// the main error type for document index operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// the requested document was not found
    #[error("document not found: collection={collection}, key={key}")]
    DocumentNotFound { collection: CollectionName, key: DocKey },

    /// invalid collection name or document key
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// data integrity check failed
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// repo is not initialized
    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    /// the index head moved while a batch was being written
    #[error("concurrent modification: index head was updated by another writer")]
    ConcurrentModification,

    /// the backend is temporarily unable to serve requests
    #[error("index unavailable: {0}")]
    Unavailable(String),

    /// the tree entry has an unexpected type
    #[error("unexpected entry type at {path}: expected {expected}, found {found}")]
    UnexpectedEntryType {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the document doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::DocumentNotFound { .. })
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrentModification | StorageError::Unavailable(_) | StorageError::Io(_)
        )
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StorageError::DocumentNotFound {
            collection: CollectionName::branches(),
            key: DocKey::new("MAIN").unwrap(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_retriable());

        let unavailable = StorageError::Unavailable("connection reset".to_string());
        assert!(!unavailable.is_not_found());
        assert!(unavailable.is_retriable());
        assert!(StorageError::ConcurrentModification.is_retriable());
    }
}
