//! Data model: typed ids, content references and the persisted records.

mod ids;
mod records;
mod registry;

pub use ids::{ArtifactId, ContentId, ContentRef, ContentSet, ContentType, EntryId, RepositoryId, ResourceId, VersionId};
pub use records::{
    Artifact, ContentArtifact, ContentUnit, CreatedResource, Model, Repository, RepositoryContent, RepositoryVersion,
    Stored,
};
pub use registry::ContentTypeRegistry;
