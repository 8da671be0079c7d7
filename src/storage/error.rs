use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::{InvalidNameError, RecordKey, TableName};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("record not found: {table}/{key}")]
    RecordNotFound { table: TableName, key: RecordKey },

    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("table already exists: {0}")]
    TableAlreadyExists(TableName),

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// a blob's content doesn't match where it is stored
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    #[error("store not initialized: {0}")]
    NotInitialized(PathBuf),

    #[error("store has no commits")]
    EmptyRepository,

    #[error("commit not found: {0}")]
    CommitNotFound(String),

    #[error("unexpected entry at {path}: expected {expected}, found {found}")]
    UnexpectedEntryType {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("branch already exists: {0}")]
    BranchAlreadyExists(String),

    /// a compare-and-swap on a branch lost to another writer
    #[error("branch {branch} moved concurrently")]
    ConcurrentModification { branch: String },

    /// the record body doesn't have the expected shape
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::RecordNotFound { .. }
                | StorageError::TableNotFound(_)
                | StorageError::RefNotFound(_)
                | StorageError::CommitNotFound(_)
        )
    }

    /// Running the whole operation again may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::ConcurrentModification { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let missing = StorageError::RecordNotFound {
            table: TableName::new("content").unwrap(),
            key: RecordKey::new("123").unwrap(),
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_retriable());
        assert_eq!(missing.to_string(), "record not found: content/123");

        let moved = StorageError::ConcurrentModification {
            branch: "main".to_string(),
        };
        assert!(moved.is_retriable());
        assert!(!moved.is_not_found());
    }
}
