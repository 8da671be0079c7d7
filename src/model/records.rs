//! Persisted records.
//!
//! Each model lives in its own table and is stored as one JSON record per
//! row. [`Model`] ties a type to its table and handles the record envelope.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ids::{ArtifactId, ContentId, ContentRef, ContentType, RepositoryId, VersionId};
use crate::storage::{Record, RecordKey, StorageResult, TableName, WriteBatch};
use crate::transaction::{ReadView, TransactionResult};

/// A record type bound to a table.
pub trait Model: Serialize + DeserializeOwned + Sized {
    const TABLE: &'static str;

    fn table() -> TableName {
        TableName::from_static(Self::TABLE)
    }

    fn load(view: &impl ReadView, key: &RecordKey) -> TransactionResult<Option<Stored<Self>>> {
        match view.read(&Self::table(), key)? {
            Some(record) => Ok(Some(Stored::decode(record)?)),
            None => Ok(None),
        }
    }

    fn load_all(view: &impl ReadView) -> TransactionResult<Vec<Stored<Self>>> {
        view.scan(&Self::table())?
            .into_iter()
            .map(|record| Stored::decode(record).map_err(Into::into))
            .collect()
    }

    /// Stage this model as a new record under `key`.
    fn stage_insert(&self, batch: &mut WriteBatch, key: RecordKey) -> StorageResult<()> {
        let record = Record::encode(key, self)?;
        batch.ensure_table(Self::table()).put(Self::table(), record);
        Ok(())
    }

    fn stage_delete(batch: &mut WriteBatch, key: RecordKey) {
        batch.delete(Self::table(), key);
    }
}

/// A model together with the record it was read from.
#[derive(Debug, Clone)]
pub struct Stored<M> {
    pub record: Record,
    pub model: M,
}

impl<M: Model> Stored<M> {
    pub fn decode(record: Record) -> StorageResult<Self> {
        let model = record.decode()?;
        Ok(Self { record, model })
    }

    pub fn key(&self) -> &RecordKey {
        &self.record.key
    }

    /// the record key as a typed id
    pub fn id<I: From<RecordKey>>(&self) -> I {
        I::from(self.record.key.clone())
    }

    pub fn created_at(&self) -> &str {
        &self.record.created_at
    }

    /// Stage the current model as the next revision of the record.
    pub fn stage_update(&self, batch: &mut WriteBatch) -> StorageResult<()> {
        let record = self.record.clone().with_model(&self.model)?;
        batch.put(M::table(), record);
        Ok(())
    }

    pub fn stage_delete(&self, batch: &mut WriteBatch) {
        M::stage_delete(batch, self.record.key.clone());
    }
}

/// A named collection of content with a version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// highest version number ever issued
    pub last_version: u64,
}

impl Model for Repository {
    const TABLE: &'static str = "repositories";
}

/// One numbered snapshot of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryVersion {
    pub repository: RepositoryId,
    pub number: u64,
    /// incomplete versions are invisible to readers
    pub complete: bool,
    #[serde(default)]
    pub base_version: Option<VersionId>,
}

impl Model for RepositoryVersion {
    const TABLE: &'static str = "repository_versions";
}

/// Ledger entry: `content` was added by `version_added` and, if set,
/// removed by `version_removed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryContent {
    pub repository: RepositoryId,
    pub content_type: ContentType,
    pub content_id: ContentId,
    pub version_added: VersionId,
    #[serde(default)]
    pub version_removed: Option<VersionId>,
}

impl RepositoryContent {
    pub fn content(&self) -> ContentRef {
        ContentRef::new(self.content_type.clone(), self.content_id.clone())
    }

    pub fn is_active(&self) -> bool {
        self.version_removed.is_none()
    }
}

impl Model for RepositoryContent {
    const TABLE: &'static str = "repository_content";
}

/// A content unit. Its record key is its [`ContentId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub content_type: ContentType,
    /// type-specific fields
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Model for ContentUnit {
    const TABLE: &'static str = "content";
}

/// Backing bytes of content, held by a blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// location relative to the blob storage root
    pub location: String,
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl Model for Artifact {
    const TABLE: &'static str = "artifacts";
}

/// Links a content unit to one of its artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentArtifact {
    pub content: ContentId,
    pub artifact: ArtifactId,
    pub relative_path: String,
}

impl Model for ContentArtifact {
    const TABLE: &'static str = "content_artifacts";
}

/// Marks a version produced by a build, for the job layer to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResource {
    pub repository: RepositoryId,
    pub version: VersionId,
    pub number: u64,
}

impl Model for CreatedResource {
    const TABLE: &'static str = "created_resources";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::GitStore;
    use crate::transaction::Snapshot;
    use tempfile::TempDir;

    #[test]
    fn test_table_names_are_valid() {
        for name in [
            Repository::TABLE,
            RepositoryVersion::TABLE,
            RepositoryContent::TABLE,
            ContentUnit::TABLE,
            Artifact::TABLE,
            ContentArtifact::TABLE,
            CreatedResource::TABLE,
        ] {
            assert_eq!(TableName::new(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn test_stage_load_update() {
        let dir = TempDir::new().unwrap();
        let store = GitStore::init(dir.path()).unwrap();
        let id = RepositoryId::generate();

        let repo = Repository {
            name: "alpha".to_string(),
            description: None,
            last_version: 0,
        };
        let mut batch = WriteBatch::new("create");
        repo.stage_insert(&mut batch, id.key().clone()).unwrap();
        let head = store.apply_batch(&batch, store.head().unwrap(), None).unwrap();

        let view = Snapshot::at(store.clone(), head);
        let mut stored = Repository::load(&view, id.key()).unwrap().unwrap();
        assert_eq!(stored.model, repo);
        assert_eq!(stored.id::<RepositoryId>(), id);

        stored.model.last_version = 4;
        let mut batch = WriteBatch::new("bump");
        stored.stage_update(&mut batch).unwrap();
        let head = store.apply_batch(&batch, head, None).unwrap();

        let view = Snapshot::at(store, head);
        let all = Repository::load_all(&view).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].model.last_version, 4);
        assert_eq!(all[0].record.revision, 2);
    }

    #[test]
    fn test_ledger_entry_round_trips_null_removal() {
        let entry = RepositoryContent {
            repository: RepositoryId::generate(),
            content_type: ContentType::new("file.file").unwrap(),
            content_id: ContentId::new("c1").unwrap(),
            version_added: VersionId::generate(),
            version_removed: None,
        };
        let record = Record::encode(RecordKey::new("e1").unwrap(), &entry).unwrap();
        assert_eq!(record.get("version_removed"), Some(&Value::Null));
        assert_eq!(record.decode::<RepositoryContent>().unwrap(), entry);
        assert!(entry.is_active());
    }
}
