use std::path::PathBuf;

use thiserror::Error;

use crate::storage::StorageError;

pub type TransactionResult<T> = Result<T, TransactionError>;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Main moved while the transaction was open.
    ///
    /// `paths` lists the records both sides touched; it is empty when the
    /// writes did not overlap.
    #[error("transaction conflict on {}", conflict_paths(.paths))]
    Conflict { paths: Vec<PathBuf> },

    /// A snapshot transaction found main moved under it.
    #[error("serialization failure, retry the transaction")]
    SerializationFailure,

    #[error("internal transaction error: {0}")]
    Internal(String),
}

fn conflict_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no shared paths (main moved)".to_string();
    }
    let shown: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    shown.join(", ")
}

impl TransactionError {
    /// Lost races are retryable, everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::Conflict { .. } | TransactionError::SerializationFailure => true,
            TransactionError::Storage(e) => e.is_retriable(),
            TransactionError::Internal(_) => false,
        }
    }

    pub fn conflict(paths: Vec<PathBuf>) -> Self {
        Self::Conflict { paths }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_races_are_retryable() {
        assert!(TransactionError::conflict(vec![PathBuf::from("repositories/abc.json")]).is_retryable());
        assert!(TransactionError::SerializationFailure.is_retryable());

        let moved = TransactionError::Storage(StorageError::ConcurrentModification {
            branch: "main".to_string(),
        });
        assert!(moved.is_retryable());

        assert!(!TransactionError::Internal("boom".to_string()).is_retryable());
        assert!(!TransactionError::Storage(StorageError::EmptyRepository).is_retryable());
    }

    #[test]
    fn test_conflict_display() {
        let empty = TransactionError::conflict(Vec::new());
        assert!(empty.to_string().contains("main moved"));

        let paths = TransactionError::conflict(vec![
            PathBuf::from("repository_content/a.json"),
            PathBuf::from("repositories/b.json"),
        ]);
        assert!(paths
            .to_string()
            .ends_with("repository_content/a.json, repositories/b.json"));
    }
}
