//! Errors of the store facade and how they surface to API callers.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::orphan::BlobError;
use crate::storage::{InvalidNameError, StorageError};
use crate::transaction::TransactionError;
use crate::version::VersionError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error("blob storage error: {0}")]
    Blob(#[from] BlobError),

    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    #[error("content already exists: {0}")]
    ContentExists(String),

    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("store not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What an API layer should answer for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStatus {
    Conflict,
    NotFound,
    BadRequest,
    Failure,
}

impl ApiStatus {
    pub fn http_code(&self) -> u16 {
        match self {
            ApiStatus::Conflict => 409,
            ApiStatus::NotFound => 404,
            ApiStatus::BadRequest => 400,
            ApiStatus::Failure => 500,
        }
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiStatus::Conflict => write!(f, "conflict"),
            ApiStatus::NotFound => write!(f, "not found"),
            ApiStatus::BadRequest => write!(f, "bad request"),
            ApiStatus::Failure => write!(f, "failure"),
        }
    }
}

impl StoreError {
    pub fn status(&self) -> ApiStatus {
        match self {
            StoreError::Version(e) if e.is_conflict() => ApiStatus::Conflict,
            StoreError::Version(e) if e.is_not_found() => ApiStatus::NotFound,
            StoreError::Version(VersionError::UnknownContentType(_) | VersionError::InvalidName(_)) => {
                ApiStatus::BadRequest
            }
            StoreError::RepositoryExists(_) | StoreError::ContentExists(_) => ApiStatus::Conflict,
            StoreError::ContentNotFound(_) | StoreError::ArtifactNotFound(_) | StoreError::NotFound(_) => {
                ApiStatus::NotFound
            }
            StoreError::Storage(e) if e.is_not_found() => ApiStatus::NotFound,
            StoreError::InvalidName(_) | StoreError::InvalidConfig(_) => ApiStatus::BadRequest,
            _ => ApiStatus::Failure,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == ApiStatus::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == ApiStatus::Conflict
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Version(e) => e.is_retryable(),
            StoreError::Transaction(e) => e.is_retryable(),
            StoreError::Storage(e) => e.is_retriable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepositoryId;

    #[test]
    fn test_status_mapping() {
        let repo = RepositoryId::generate();

        let immutable: StoreError = VersionError::ImmutableVersion {
            repository: repo.clone(),
            number: 1,
        }
        .into();
        assert_eq!(immutable.status(), ApiStatus::Conflict);
        assert_eq!(immutable.status().http_code(), 409);

        let missing: StoreError = VersionError::VersionNotFound { repository: repo, number: 4 }.into();
        assert_eq!(missing.status(), ApiStatus::NotFound);

        let bad: StoreError = InvalidNameError::Empty.into();
        assert_eq!(bad.status(), ApiStatus::BadRequest);

        let broken: StoreError = VersionError::ConstraintViolation("dup".to_string()).into();
        assert_eq!(broken.status(), ApiStatus::Failure);
    }

    #[test]
    fn test_retryable_through_layers() {
        let raced: StoreError = VersionError::from(TransactionError::SerializationFailure).into();
        assert!(raced.is_retryable());
        assert!(!StoreError::RepositoryExists("r".to_string()).is_retryable());
    }
}
