//! Store API - the repository, version and content surface of contentdb.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::db::error::{StoreError, StoreResult};
use crate::model::{
    Artifact, ArtifactId, ContentArtifact, ContentId, ContentRef, ContentSet, ContentType, ContentTypeRegistry,
    ContentUnit, CreatedResource, Model, Repository, RepositoryContent, RepositoryId, RepositoryVersion, ResourceId,
    Stored,
};
use crate::orphan::{BlobStorage, FsBlobStorage, OrphanReclaimer, ProgressSink, ReclaimReport, TracingProgress};
use crate::storage::{CommitInfo, GitSignature, GitStore, InvalidNameError, StoreStats, WriteBatch};
use crate::transaction::{IsolationLevel, ReadView, Snapshot, Transaction, TransactionManager, TxActive};
use crate::version::{Deletion, VersionBuilder, VersionDeleter, VersionError, VersionInfo, VersionReader};

/// Store configuration options.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the store directory.
    pub path: PathBuf,
    /// Create if doesn't exist.
    pub create_if_missing: bool,
    pub isolation: IsolationLevel,
    /// Author of the commits the store makes.
    pub signature: GitSignature,
    /// How often an operation that lost a commit race is attempted.
    pub max_retries: u32,
    /// Known content types. Empty accepts every type.
    pub registry: ContentTypeRegistry,
    /// Where artifact bytes live; `<path>/artifacts` when unset.
    pub blob_root: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".contentdb"),
            create_if_missing: true,
            isolation: IsolationLevel::default(),
            signature: GitSignature::default(),
            max_retries: 3,
            registry: ContentTypeRegistry::new(),
            blob_root: None,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = attempts;
        self
    }

    /// Register a content type, closing the registry to unregistered ones.
    pub fn with_content_type(mut self, tag: &str, label: &str) -> StoreResult<Self> {
        self.registry = self.registry.with_content_type(tag, label)?;
        Ok(self)
    }

    pub fn blob_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.blob_root = Some(root.into());
        self
    }

    fn validate(&self) -> StoreResult<()> {
        if self.max_retries == 0 {
            return Err(StoreError::InvalidConfig("max_retries must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// A repository as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryInfo {
    pub id: RepositoryId,
    pub name: String,
    pub description: Option<String>,
    /// highest version number ever issued
    pub last_version: u64,
    /// number of the latest complete version
    pub latest_version: Option<u64>,
}

/// Partial update of a repository. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

/// A version with its content summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionDetail {
    #[serde(flatten)]
    pub info: VersionInfo,
    pub present: BTreeMap<ContentType, usize>,
    pub added: BTreeMap<ContentType, usize>,
    pub removed: BTreeMap<ContentType, usize>,
}

/// The store handle.
///
/// Clone this to share across threads - everything inside is shared.
#[derive(Clone)]
pub struct ContentStore {
    config: StoreConfig,
    store: GitStore,
    manager: TransactionManager,
    registry: Arc<ContentTypeRegistry>,
    builder: VersionBuilder,
    deleter: VersionDeleter,
    blobs: Arc<dyn BlobStorage>,
    /// keeps a temporary store alive as long as any handle
    _temp: Option<Arc<tempfile::TempDir>>,
}

impl ContentStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_config(StoreConfig::new(path.as_ref()))
    }

    pub fn open_with_config(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;

        let store = if config.create_if_missing {
            std::fs::create_dir_all(&config.path)?;
            GitStore::open_or_init(&config.path)?
        } else if config.path.exists() {
            GitStore::open(&config.path)?
        } else {
            return Err(StoreError::NotFound(config.path.clone()));
        };
        store.set_signature(config.signature.clone());

        let blob_root = config
            .blob_root
            .clone()
            .unwrap_or_else(|| config.path.join("artifacts"));
        let blobs: Arc<dyn BlobStorage> = Arc::new(FsBlobStorage::new(blob_root));

        let manager = TransactionManager::with_isolation(store.clone(), config.isolation);
        match manager.cleanup_abandoned() {
            Ok(0) => {}
            Ok(count) => tracing::warn!(count, "removed abandoned transaction branches"),
            Err(e) => tracing::warn!(error = %e, "could not clean up abandoned transactions"),
        }

        let registry = Arc::new(config.registry.clone());
        let builder = VersionBuilder::new(manager.clone(), registry.clone()).with_max_attempts(config.max_retries);
        let deleter = VersionDeleter::new(manager.clone()).with_max_attempts(config.max_retries);

        tracing::debug!(path = %config.path.display(), isolation = %config.isolation, "store opened");
        Ok(Self {
            config,
            store,
            manager,
            registry,
            builder,
            deleter,
            blobs,
            _temp: None,
        })
    }

    /// A store in a temporary directory, removed when the last handle drops.
    pub fn temporary() -> StoreResult<Self> {
        Self::temporary_with_config(StoreConfig::default())
    }

    pub fn temporary_with_config(config: StoreConfig) -> StoreResult<Self> {
        let dir = tempfile::TempDir::new()?;
        let config = StoreConfig {
            path: dir.path().to_path_buf(),
            create_if_missing: true,
            ..config
        };
        let mut store = Self::open_with_config(config)?;
        store._temp = Some(Arc::new(dir));
        Ok(store)
    }

    /// Replace the blob storage artifact bytes are deleted from.
    pub fn with_blob_storage(mut self, blobs: Arc<dyn BlobStorage>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &ContentTypeRegistry {
        &self.registry
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.manager
    }

    pub fn builder(&self) -> &VersionBuilder {
        &self.builder
    }

    /// A reader over the current state of main.
    pub fn reader(&self) -> StoreResult<VersionReader<Snapshot>> {
        Ok(VersionReader::new(Snapshot::head(self.store.clone())?))
    }

    fn write<T>(&self, f: impl FnMut(&mut Transaction<TxActive>) -> StoreResult<T>) -> StoreResult<T> {
        self.manager.with_retries(self.config.max_retries, StoreError::is_retryable, f)
    }

    // ==================== Repositories ====================

    pub fn create_repository(&self, name: &str, description: Option<&str>) -> StoreResult<RepositoryInfo> {
        let name = validate_repository_name(name)?;
        let id = self.write(|tx| {
            if find_repository(&*tx, &name)?.is_some() {
                return Err(StoreError::RepositoryExists(name.clone()));
            }

            let id = RepositoryId::generate();
            let mut batch = WriteBatch::new(format!("create repository {}", name));
            Repository {
                name: name.clone(),
                description: description.map(str::to_string),
                last_version: 0,
            }
            .stage_insert(&mut batch, id.key().clone())?;
            tx.apply(&batch)?;
            Ok(id)
        })?;

        tracing::info!(repository = %name, id = %id, "repository created");
        Ok(RepositoryInfo {
            id,
            name,
            description: description.map(str::to_string),
            last_version: 0,
            latest_version: None,
        })
    }

    pub fn get_repository(&self, name: &str) -> StoreResult<RepositoryInfo> {
        let reader = self.reader()?;
        let repo = require_repository(reader.view(), name)?;
        repository_info(&reader, repo)
    }

    /// All repositories, by name.
    pub fn list_repositories(&self) -> StoreResult<Vec<RepositoryInfo>> {
        let reader = self.reader()?;
        let mut repos = Repository::load_all(reader.view())?;
        repos.sort_by(|a, b| a.model.name.cmp(&b.model.name));
        repos.into_iter().map(|repo| repository_info(&reader, repo)).collect()
    }

    pub fn update_repository(&self, name: &str, update: &RepositoryUpdate) -> StoreResult<RepositoryInfo> {
        let new_name = update.name.as_deref().map(validate_repository_name).transpose()?;
        self.write(|tx| {
            let mut repo = require_repository(&*tx, name)?;
            if let Some(new_name) = &new_name {
                if new_name != name && find_repository(&*tx, new_name)?.is_some() {
                    return Err(StoreError::RepositoryExists(new_name.clone()));
                }
                repo.model.name = new_name.clone();
            }
            if let Some(description) = &update.description {
                repo.model.description = description.clone();
            }

            let mut batch = WriteBatch::new(format!("update repository {}", name));
            repo.stage_update(&mut batch)?;
            tx.apply(&batch)?;
            Ok(())
        })?;

        let name = new_name.as_deref().unwrap_or(name);
        tracing::info!(repository = %name, "repository updated");
        self.get_repository(name)
    }

    /// Delete a repository with its versions, ledger rows and created
    /// resource markers. Content units stay until the next orphan cleanup.
    pub fn delete_repository(&self, name: &str) -> StoreResult<()> {
        let removed = self.write(|tx| {
            let repo = require_repository(&*tx, name)?;
            let id: RepositoryId = repo.id();

            let mut batch = WriteBatch::new(format!("delete repository {}", name));
            let mut removed = 0;
            for version in RepositoryVersion::load_all(&*tx)? {
                if version.model.repository == id {
                    version.stage_delete(&mut batch);
                    removed += 1;
                }
            }
            for entry in RepositoryContent::load_all(&*tx)? {
                if entry.model.repository == id {
                    entry.stage_delete(&mut batch);
                }
            }
            for marker in CreatedResource::load_all(&*tx)? {
                if marker.model.repository == id {
                    marker.stage_delete(&mut batch);
                }
            }
            repo.stage_delete(&mut batch);
            tx.apply(&batch)?;
            Ok(removed)
        })?;

        tracing::info!(repository = %name, versions = removed, "repository deleted");
        Ok(())
    }

    /// Discard versions left unfinished by an interrupted build.
    pub fn cleanup_incomplete(&self, name: &str) -> StoreResult<Vec<u64>> {
        let id = self.repository_id(name)?;
        Ok(self.deleter.cleanup_incomplete(&id)?)
    }

    pub fn repository_id(&self, name: &str) -> StoreResult<RepositoryId> {
        let snapshot = Snapshot::head(self.store.clone())?;
        Ok(require_repository(&snapshot, name)?.id())
    }

    // ==================== Content ====================

    /// Create a content unit. Without an id one is generated.
    pub fn create_content(
        &self,
        content_type: &ContentType,
        id: Option<ContentId>,
        fields: BTreeMap<String, Value>,
    ) -> StoreResult<ContentRef> {
        if !self.registry.accepts(content_type) {
            return Err(VersionError::UnknownContentType(content_type.clone()).into());
        }
        let id = id.unwrap_or_else(ContentId::generate);

        self.write(|tx| {
            if ContentUnit::load(&*tx, id.key())?.is_some() {
                return Err(StoreError::ContentExists(id.to_string()));
            }
            let mut batch = WriteBatch::new(format!("create {} content {}", content_type, id));
            ContentUnit {
                content_type: content_type.clone(),
                fields: fields.clone(),
            }
            .stage_insert(&mut batch, id.key().clone())?;
            tx.apply(&batch)?;
            Ok(())
        })?;

        tracing::debug!(content_type = %content_type, id = %id, "content created");
        Ok(ContentRef::new(content_type.clone(), id))
    }

    pub fn get_content(&self, id: &ContentId) -> StoreResult<ContentUnit> {
        let snapshot = Snapshot::head(self.store.clone())?;
        ContentUnit::load(&snapshot, id.key())?
            .map(|unit| unit.model)
            .ok_or_else(|| StoreError::ContentNotFound(id.to_string()))
    }

    /// Content units, optionally of one type only, ordered by id.
    pub fn list_content(&self, content_type: Option<&ContentType>) -> StoreResult<Vec<(ContentId, ContentUnit)>> {
        let snapshot = Snapshot::head(self.store.clone())?;
        let mut units: Vec<(ContentId, ContentUnit)> = ContentUnit::load_all(&snapshot)?
            .into_iter()
            .filter(|unit| content_type.is_none_or(|t| &unit.model.content_type == t))
            .map(|unit| (unit.id(), unit.model))
            .collect();
        units.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(units)
    }

    pub fn create_artifact(&self, location: &str, size: u64, sha256: Option<&str>) -> StoreResult<ArtifactId> {
        let id = ArtifactId::generate();
        self.write(|tx| {
            let mut batch = WriteBatch::new(format!("create artifact {}", location));
            Artifact {
                location: location.to_string(),
                size,
                sha256: sha256.map(str::to_string),
            }
            .stage_insert(&mut batch, id.key().clone())?;
            tx.apply(&batch)?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Link an artifact to a content unit under `relative_path`.
    pub fn attach_artifact(&self, content: &ContentId, artifact: &ArtifactId, relative_path: &str) -> StoreResult<()> {
        self.write(|tx| {
            if ContentUnit::load(&*tx, content.key())?.is_none() {
                return Err(StoreError::ContentNotFound(content.to_string()));
            }
            if Artifact::load(&*tx, artifact.key())?.is_none() {
                return Err(StoreError::ArtifactNotFound(artifact.to_string()));
            }

            let mut batch = WriteBatch::new(format!("attach {} to {}", artifact, content));
            ContentArtifact {
                content: content.clone(),
                artifact: artifact.clone(),
                relative_path: relative_path.to_string(),
            }
            .stage_insert(&mut batch, ResourceId::generate().key().clone())?;
            tx.apply(&batch)?;
            Ok(())
        })
    }

    // ==================== Versions ====================

    pub fn list_versions(&self, name: &str) -> StoreResult<Vec<VersionInfo>> {
        let reader = self.reader()?;
        let id: RepositoryId = require_repository(reader.view(), name)?.id();
        Ok(reader.list_versions(&id)?)
    }

    pub fn version_detail(&self, name: &str, number: u64) -> StoreResult<VersionDetail> {
        let reader = self.reader()?;
        let id: RepositoryId = require_repository(reader.view(), name)?.id();
        Ok(VersionDetail {
            info: reader.get_version(&id, number)?,
            present: reader.summary(&id, number)?,
            added: reader.added_by(&id, number)?.counts(),
            removed: reader.removed_by(&id, number)?.counts(),
        })
    }

    pub fn version_content(&self, name: &str, number: u64) -> StoreResult<ContentSet> {
        let reader = self.reader()?;
        let id: RepositoryId = require_repository(reader.view(), name)?.id();
        Ok(reader.content_at(&id, number)?)
    }

    /// Create a new version by adding and then removing content, starting
    /// from `base` or from the latest content.
    pub fn add_and_remove(
        &self,
        name: &str,
        base: Option<u64>,
        add: &ContentSet,
        remove: &ContentSet,
    ) -> StoreResult<VersionInfo> {
        let id = self.repository_id(name)?;
        let (info, _) = self.builder.build(&id, base, |guard| {
            if !add.is_empty() {
                guard.add_content(add)?;
            }
            if !remove.is_empty() {
                guard.remove_content(remove)?;
            }
            Ok(())
        })?;
        Ok(info)
    }

    pub fn delete_version(&self, name: &str, number: u64) -> StoreResult<Deletion> {
        let id = self.repository_id(name)?;
        tracing::info!(repository = %name, number, "deleting version");
        Ok(self.deleter.delete_version(&id, number)?)
    }

    pub fn versions_containing(&self, name: &str, content: &ContentRef) -> StoreResult<Vec<u64>> {
        let reader = self.reader()?;
        let id: RepositoryId = require_repository(reader.view(), name)?.id();
        Ok(reader.versions_containing(&id, content)?)
    }

    /// Versions produced by builds of this repository.
    pub fn created_resources(&self, name: &str) -> StoreResult<Vec<CreatedResource>> {
        let snapshot = Snapshot::head(self.store.clone())?;
        let id: RepositoryId = require_repository(&snapshot, name)?.id();
        let mut markers: Vec<CreatedResource> = CreatedResource::load_all(&snapshot)?
            .into_iter()
            .map(|marker| marker.model)
            .filter(|marker| marker.repository == id)
            .collect();
        markers.sort_by_key(|marker| marker.number);
        Ok(markers)
    }

    // ==================== Maintenance ====================

    pub fn reclaim_orphans(&self) -> StoreResult<ReclaimReport> {
        self.reclaim_orphans_with(Arc::new(TracingProgress))
    }

    pub fn reclaim_orphans_with(&self, progress: Arc<dyn ProgressSink>) -> StoreResult<ReclaimReport> {
        let reclaimer = OrphanReclaimer::new(self.manager.clone(), self.blobs.clone(), progress)
            .with_max_attempts(self.config.max_retries);
        Ok(reclaimer.reclaim()?)
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        Ok(self.store.stats(self.store.head()?)?)
    }

    /// Commits on main, newest first.
    pub fn history(&self, limit: Option<usize>) -> StoreResult<Vec<CommitInfo>> {
        Ok(self.store.history(self.store.head()?, limit)?)
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("path", &self.config.path)
            .field("temporary", &self._temp.is_some())
            .finish()
    }
}

fn validate_repository_name(name: &str) -> StoreResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(InvalidNameError::Empty.into());
    }
    if let Some((position, char)) = name.chars().enumerate().find(|(_, c)| c.is_control()) {
        return Err(InvalidNameError::InvalidCharacter { char, position }.into());
    }
    Ok(name.to_string())
}

fn find_repository(view: &impl ReadView, name: &str) -> StoreResult<Option<Stored<Repository>>> {
    Ok(Repository::load_all(view)?
        .into_iter()
        .find(|repo| repo.model.name == name))
}

fn require_repository(view: &impl ReadView, name: &str) -> StoreResult<Stored<Repository>> {
    find_repository(view, name)?.ok_or_else(|| VersionError::RepositoryNotFound(name.to_string()).into())
}

fn repository_info(reader: &VersionReader<Snapshot>, repo: Stored<Repository>) -> StoreResult<RepositoryInfo> {
    let id: RepositoryId = repo.id();
    let latest_version = reader.latest(&id)?.map(|v| v.number);
    Ok(RepositoryInfo {
        id,
        name: repo.model.name,
        description: repo.model.description,
        last_version: repo.model.last_version,
        latest_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ApiStatus;
    use crate::orphan::MemoryBlobStorage;

    fn store() -> ContentStore {
        let config = StoreConfig::default().with_content_type("file.file", "File").unwrap();
        ContentStore::temporary_with_config(config).unwrap()
    }

    fn file(store: &ContentStore, id: &str) -> ContentRef {
        store
            .create_content(
                &ContentType::new("file.file").unwrap(),
                Some(ContentId::new(id).unwrap()),
                BTreeMap::new(),
            )
            .unwrap()
    }

    #[test]
    fn test_open_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        assert!(store.list_repositories().unwrap().is_empty());

        let missing = ContentStore::open_with_config(StoreConfig::new(dir.path().join("nope")).create_if_missing(false));
        assert_eq!(missing.unwrap_err().status(), ApiStatus::NotFound);
    }

    #[test]
    fn test_repository_crud() {
        let store = store();
        store.create_repository("isos", Some("install media")).unwrap();

        let dup = store.create_repository("isos", None).unwrap_err();
        assert_eq!(dup.status(), ApiStatus::Conflict);
        assert_eq!(store.create_repository("  ", None).unwrap_err().status(), ApiStatus::BadRequest);

        let update = RepositoryUpdate {
            name: Some("media".to_string()),
            description: Some(None),
        };
        let info = store.update_repository("isos", &update).unwrap();
        assert_eq!(info.name, "media");
        assert_eq!(info.description, None);
        assert!(store.get_repository("isos").unwrap_err().is_not_found());

        store.delete_repository("media").unwrap();
        assert!(store.list_repositories().unwrap().is_empty());
    }

    #[test]
    fn test_add_and_remove_flow() {
        let store = store();
        store.create_repository("files", None).unwrap();
        let (a, b) = (file(&store, "a"), file(&store, "b"));

        let v1 = store
            .add_and_remove("files", None, &[a.clone(), b.clone()].into_iter().collect(), &ContentSet::new())
            .unwrap();
        let v2 = store
            .add_and_remove("files", None, &ContentSet::new(), &std::iter::once(a.clone()).collect())
            .unwrap();
        assert_eq!((v1.number, v2.number), (1, 2));

        let detail = store.version_detail("files", 2).unwrap();
        let file_type = ContentType::new("file.file").unwrap();
        assert_eq!(detail.present.get(&file_type), Some(&1));
        assert_eq!(detail.removed.get(&file_type), Some(&1));
        assert!(detail.added.is_empty());

        assert_eq!(store.versions_containing("files", &a).unwrap(), vec![1]);
        assert_eq!(store.created_resources("files").unwrap().len(), 2);

        let info = store.get_repository("files").unwrap();
        assert_eq!(info.latest_version, Some(2));
    }

    #[test]
    fn test_immutable_version_maps_to_conflict() {
        let store = store();
        store.create_repository("files", None).unwrap();
        let a = file(&store, "a");
        let v1 = store
            .add_and_remove("files", None, &std::iter::once(a).collect(), &ContentSet::new())
            .unwrap();

        let repo = store.repository_id("files").unwrap();
        let err: StoreError = store
            .builder()
            .add_content(&repo, &v1.id, &ContentSet::new())
            .unwrap_err()
            .into();
        assert_eq!(err.status(), ApiStatus::Conflict);
    }

    #[test]
    fn test_delete_repository_leaves_orphans_for_reclaim() {
        let blobs = Arc::new(MemoryBlobStorage::new());
        let store = store().with_blob_storage(blobs.clone());
        store.create_repository("files", None).unwrap();
        let a = file(&store, "a");
        let artifact = store.create_artifact("aa/bb", 10, None).unwrap();
        store.attach_artifact(&a.id, &artifact, "a.txt").unwrap();
        store
            .add_and_remove("files", None, &std::iter::once(a.clone()).collect(), &ContentSet::new())
            .unwrap();

        assert_eq!(store.reclaim_orphans().unwrap().content_removed, 0);

        store.delete_repository("files").unwrap();
        assert!(store.created_resources("files").unwrap_err().is_not_found());

        let report = store.reclaim_orphans().unwrap();
        assert_eq!(report.content_removed, 1);
        assert_eq!(report.artifacts_removed, 1);
        assert!(blobs.deleted().contains("aa/bb"));
        assert!(store.get_content(&a.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_unknown_content_type_rejected() {
        let store = store();
        let err = store
            .create_content(&ContentType::new("rpm.package").unwrap(), None, BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.status(), ApiStatus::BadRequest);
    }
}
