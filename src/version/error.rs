//! Version engine error types.

use thiserror::Error;

use crate::model::{ContentType, RepositoryId};
use crate::storage::{InvalidNameError, StorageError};
use crate::transaction::TransactionError;

pub type VersionResult<T> = Result<T, VersionError>;

#[derive(Debug, Error)]
pub enum VersionError {
    /// content changes were attempted on a finished version
    #[error("version {number} of repository {repository} is complete and cannot be modified")]
    ImmutableVersion { repository: RepositoryId, number: u64 },

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("version {number} not found in repository {repository}")]
    VersionNotFound { repository: RepositoryId, number: u64 },

    /// expected when asking for the successor of the latest version
    #[error("version {number} of repository {repository} has no successor")]
    NoSuccessor { repository: RepositoryId, number: u64 },

    #[error("unknown content type: {0}")]
    UnknownContentType(ContentType),

    /// a ledger uniqueness rule would be broken; indicates a bug upstream
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),
}

impl VersionError {
    pub fn is_not_found(&self) -> bool {
        match self {
            VersionError::RepositoryNotFound(_)
            | VersionError::VersionNotFound { .. }
            | VersionError::NoSuccessor { .. } => true,
            VersionError::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, VersionError::ImmutableVersion { .. })
    }

    /// whether re-running the whole operation from scratch may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            VersionError::Transaction(e) => e.is_retryable(),
            VersionError::Storage(e) => e.is_retriable(),
            _ => false,
        }
    }
}
