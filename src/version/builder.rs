//! Building new versions.
//!
//! A build is a sequence of short transactions: one that allocates the
//! version number and seeds the content from a base version, one per batch
//! of content changes, and one that marks the version complete. Until that
//! last step the version is invisible to readers. [`VersionGuard`] owns the
//! unfinished version and rolls it back if the build does not finish.

use std::sync::Arc;

use crate::model::{
    ContentSet, ContentTypeRegistry, ContentUnit, CreatedResource, Model, Repository, RepositoryId, RepositoryVersion,
    ResourceId, Stored, VersionId,
};
use crate::storage::WriteBatch;
use crate::transaction::{Snapshot, Transaction, TransactionManager, TxActive};
use crate::version::error::{VersionError, VersionResult};
use crate::version::ledger::{self, Ledger};
use crate::version::reader::VersionInfo;
use crate::version::squash::{self, VersionDeleter};

#[derive(Debug, Clone)]
pub struct VersionBuilder {
    manager: TransactionManager,
    registry: Arc<ContentTypeRegistry>,
    max_attempts: u32,
}

impl VersionBuilder {
    pub fn new(manager: TransactionManager, registry: Arc<ContentTypeRegistry>) -> Self {
        Self {
            manager,
            registry,
            max_attempts: 1,
        }
    }

    /// retry each build step that lost a commit race up to `attempts` times
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    fn run<T>(&self, f: impl FnMut(&mut Transaction<TxActive>) -> VersionResult<T>) -> VersionResult<T> {
        self.manager.with_retries(self.max_attempts, VersionError::is_retryable, f)
    }

    fn deleter(&self) -> VersionDeleter {
        VersionDeleter::new(self.manager.clone()).with_max_attempts(self.max_attempts)
    }

    /// Start a new version of `repository`.
    ///
    /// With a `base` version number the new version starts out with exactly
    /// the base's content; otherwise it starts with the latest content.
    pub fn create(&self, repository: &RepositoryId, base: Option<u64>) -> VersionResult<VersionGuard> {
        let (version, number) = self.run(|tx| {
            discard_stale(tx, repository)?;

            let mut repo = Repository::load(&*tx, repository.key())?
                .ok_or_else(|| VersionError::RepositoryNotFound(repository.to_string()))?;
            let ledger = Ledger::load(&*tx, repository)?;

            let base = match base {
                Some(base_number) => {
                    let base = ledger
                        .version(base_number)
                        .filter(|v| v.model.complete)
                        .ok_or_else(|| VersionError::VersionNotFound {
                            repository: repository.clone(),
                            number: base_number,
                        })?;
                    Some((base.id::<VersionId>(), ledger.content_at(base_number)))
                }
                None => None,
            };

            let number = repo.model.last_version + 1;
            repo.model.last_version = number;
            let version = VersionId::generate();

            let mut batch = WriteBatch::new(format!("create version {} of {}", number, repo.model.name));
            repo.stage_update(&mut batch)?;
            RepositoryVersion {
                repository: repository.clone(),
                number,
                complete: false,
                base_version: base.as_ref().map(|(id, _)| id.clone()),
            }
            .stage_insert(&mut batch, version.key().clone())?;
            CreatedResource {
                repository: repository.clone(),
                version: version.clone(),
                number,
            }
            .stage_insert(&mut batch, ResourceId::generate().key().clone())?;
            tx.apply(&batch)?;

            if let Some((_, base_content)) = &base {
                reconcile(tx, repository, &version, base_content)?;
            }

            Ok((version, number))
        })?;

        tracing::info!(repository = %repository, number, ?base, "version created");
        Ok(VersionGuard {
            builder: self.clone(),
            repository: repository.clone(),
            version,
            number,
            finished: false,
        })
    }

    /// Run `f` against a new version and complete it if `f` succeeds.
    ///
    /// If `f` fails the version is discarded and the error is returned.
    pub fn build<F, T>(&self, repository: &RepositoryId, base: Option<u64>, f: F) -> VersionResult<(VersionInfo, T)>
    where
        F: FnOnce(&mut VersionGuard) -> VersionResult<T>,
    {
        let mut guard = self.create(repository, base)?;
        match f(&mut guard) {
            Ok(value) => Ok((guard.finish()?, value)),
            Err(e) => {
                if let Err(abort_err) = guard.abort() {
                    tracing::error!(error = %abort_err, "failed to discard version after error");
                }
                Err(e)
            }
        }
    }

    /// Add content to an unfinished version. Returns how many units were new.
    ///
    /// References to content that does not exist are skipped.
    pub fn add_content(&self, repository: &RepositoryId, version: &VersionId, content: &ContentSet) -> VersionResult<usize> {
        self.check_types(content)?;
        self.run(|tx| {
            open_version(&*tx, repository, version)?;
            let existing = existing_content(&*tx, content)?;
            ledger::add_entries(tx, repository, version, &existing)
        })
    }

    /// Remove content from an unfinished version. Returns how many units
    /// were present and got removed.
    pub fn remove_content(&self, repository: &RepositoryId, version: &VersionId, content: &ContentSet) -> VersionResult<usize> {
        self.check_types(content)?;
        self.run(|tx| {
            open_version(&*tx, repository, version)?;
            ledger::close_entries(tx, repository, version, content)
        })
    }

    /// Make an unfinished version hold exactly `content` (minus references
    /// to content that does not exist). Returns `(added, removed)`.
    pub fn set_content(
        &self,
        repository: &RepositoryId,
        version: &VersionId,
        content: &ContentSet,
    ) -> VersionResult<(usize, usize)> {
        self.check_types(content)?;
        self.run(|tx| {
            open_version(&*tx, repository, version)?;
            let existing = existing_content(&*tx, content)?;
            reconcile(tx, repository, version, &existing)
        })
    }

    /// Mark an unfinished version complete, making it visible.
    pub fn complete(&self, repository: &RepositoryId, version: &VersionId) -> VersionResult<VersionInfo> {
        let info = self.run(|tx| {
            let mut stored = open_version(&*tx, repository, version)?;
            let ledger = Ledger::load(&*tx, repository)?;

            stored.model.complete = true;
            let mut batch = WriteBatch::new(format!("complete version {}", stored.model.number));
            stored.stage_update(&mut batch)?;
            tx.apply(&batch)?;

            Ok(VersionInfo::new(&ledger, &stored))
        })?;

        tracing::info!(repository = %repository, number = info.number, "version completed");
        Ok(info)
    }

    fn check_types(&self, content: &ContentSet) -> VersionResult<()> {
        match content.types().find(|t| !self.registry.accepts(t)) {
            Some(unknown) => Err(VersionError::UnknownContentType(unknown.clone())),
            None => Ok(()),
        }
    }
}

/// Discard versions left unfinished by a build that never came back.
///
/// Their ledger rows would otherwise count towards the version about to
/// be allocated, and cleaning them up later would change its content.
fn discard_stale(tx: &mut Transaction<TxActive>, repository: &RepositoryId) -> VersionResult<()> {
    let mut stale: Vec<Stored<RepositoryVersion>> =
        Ledger::load(&*tx, repository)?.incomplete_versions().cloned().collect();
    stale.sort_by_key(|v| std::cmp::Reverse(v.model.number));

    for version in stale {
        let ledger = Ledger::load(&*tx, repository)?;
        squash::delete_in(tx, &ledger, &version)?;
        tracing::warn!(
            repository = %repository,
            number = version.model.number,
            "discarded unfinished version before allocating a new one"
        );
    }
    Ok(())
}

/// Load a version that may still change.
fn open_version(
    tx: &Transaction<TxActive>,
    repository: &RepositoryId,
    version: &VersionId,
) -> VersionResult<Stored<RepositoryVersion>> {
    let stored = RepositoryVersion::load(tx, version.key())?
        .filter(|v| &v.model.repository == repository)
        .ok_or_else(|| VersionError::ConstraintViolation(format!("version {} is not part of {}", version, repository)))?;

    if stored.model.complete {
        return Err(VersionError::ImmutableVersion {
            repository: repository.clone(),
            number: stored.model.number,
        });
    }
    Ok(stored)
}

/// The references in `content` that name an existing unit of that type.
fn existing_content(tx: &Transaction<TxActive>, content: &ContentSet) -> VersionResult<ContentSet> {
    let mut existing = ContentSet::new();
    for content_ref in content.iter() {
        match ContentUnit::load(tx, content_ref.id.key())? {
            Some(unit) if unit.model.content_type == content_ref.content_type => {
                existing.insert(content_ref);
            }
            _ => tracing::debug!(content = %content_ref, "skipping unknown content"),
        }
    }
    Ok(existing)
}

/// Bring the content of `version` to exactly `target`, type by type.
fn reconcile(
    tx: &mut Transaction<TxActive>,
    repository: &RepositoryId,
    version: &VersionId,
    target: &ContentSet,
) -> VersionResult<(usize, usize)> {
    let ledger = Ledger::load(&*tx, repository)?;
    let number = ledger
        .number_of(version)
        .ok_or_else(|| VersionError::ConstraintViolation(format!("unknown version {}", version)))?;
    let current = ledger.content_at(number);

    let removed = ledger::close_entries(tx, repository, version, &current.difference(target))?;
    let added = ledger::add_entries(tx, repository, version, &target.difference(&current))?;
    Ok((added, removed))
}

/// An unfinished version.
///
/// Dropping the guard without calling [`finish`](Self::finish) discards
/// the version and every change made to it.
#[derive(Debug)]
pub struct VersionGuard {
    builder: VersionBuilder,
    repository: RepositoryId,
    version: VersionId,
    number: u64,
    finished: bool,
}

impl VersionGuard {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn id(&self) -> &VersionId {
        &self.version
    }

    pub fn repository(&self) -> &RepositoryId {
        &self.repository
    }

    pub fn add_content(&mut self, content: &ContentSet) -> VersionResult<usize> {
        self.builder.add_content(&self.repository, &self.version, content)
    }

    pub fn remove_content(&mut self, content: &ContentSet) -> VersionResult<usize> {
        self.builder.remove_content(&self.repository, &self.version, content)
    }

    pub fn set_content(&mut self, content: &ContentSet) -> VersionResult<(usize, usize)> {
        self.builder.set_content(&self.repository, &self.version, content)
    }

    /// Content of the version as built so far.
    pub fn content(&self) -> VersionResult<ContentSet> {
        let snapshot = Snapshot::head(self.builder.manager.store().clone())?;
        Ok(Ledger::load(&snapshot, &self.repository)?.content_at(self.number))
    }

    /// Complete the version.
    pub fn finish(mut self) -> VersionResult<VersionInfo> {
        let info = self.builder.complete(&self.repository, &self.version)?;
        self.finished = true;
        Ok(info)
    }

    /// Discard the version explicitly.
    pub fn abort(mut self) -> VersionResult<()> {
        self.finished = true;
        self.builder.deleter().discard(&self.repository, &self.version)
    }
}

impl Drop for VersionGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.builder.deleter().discard(&self.repository, &self.version) {
            tracing::error!(
                repository = %self.repository,
                number = self.number,
                error = %e,
                "failed to discard unfinished version"
            );
        }
    }
}
