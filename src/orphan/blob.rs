//! Where artifact bytes live.

use std::collections::BTreeSet;
use std::io;
use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use crate::model::Artifact;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("artifact location escapes the storage root: {0}")]
    InvalidLocation(String),
}

/// Backing storage for artifact bytes.
pub trait BlobStorage: Send + Sync {
    /// Remove the bytes behind `artifact`. Bytes that are already gone are
    /// not an error.
    fn delete_blob(&self, artifact: &Artifact) -> Result<(), BlobError>;
}

/// Artifacts as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStorage {
    root: PathBuf,
}

impl FsBlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of an artifact, refusing anything outside the root.
    pub fn path_of(&self, artifact: &Artifact) -> Result<PathBuf, BlobError> {
        let relative = Path::new(&artifact.location);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || artifact.location.is_empty() {
            return Err(BlobError::InvalidLocation(artifact.location.clone()));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStorage for FsBlobStorage {
    fn delete_blob(&self, artifact: &Artifact) -> Result<(), BlobError> {
        let path = self.path_of(artifact)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "blob already gone");
                Ok(())
            }
            Err(source) => Err(BlobError::Io { path, source }),
        }
    }
}

/// Blob storage that only remembers what it was asked to delete.
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    deleted: Mutex<BTreeSet<String>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// locations deleted so far
    pub fn deleted(&self) -> BTreeSet<String> {
        self.deleted.lock().clone()
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn delete_blob(&self, artifact: &Artifact) -> Result<(), BlobError> {
        self.deleted.lock().insert(artifact.location.clone());
        Ok(())
    }
}
