//! The content ledger.
//!
//! One [`RepositoryContent`] row per add/remove lifecycle segment of a
//! content unit in a repository. Content sets are never stored; they are
//! computed from the rows and the version numbers they point at.

use std::collections::HashMap;

use crate::model::{
    ContentRef, ContentSet, EntryId, Model, RepositoryContent, RepositoryId, RepositoryVersion, Stored, VersionId,
};
use crate::storage::WriteBatch;
use crate::transaction::{ReadView, Transaction, TxActive};
use crate::version::error::{VersionError, VersionResult};

/// In-memory view of one repository's versions and ledger rows.
#[derive(Debug, Clone)]
pub struct Ledger {
    repository: RepositoryId,
    /// every version row of the repository, complete or not, by number
    versions: Vec<Stored<RepositoryVersion>>,
    numbers: HashMap<VersionId, u64>,
    entries: Vec<Stored<RepositoryContent>>,
}

impl Ledger {
    pub fn load(view: &impl ReadView, repository: &RepositoryId) -> VersionResult<Self> {
        let mut versions: Vec<_> = RepositoryVersion::load_all(view)?
            .into_iter()
            .filter(|v| &v.model.repository == repository)
            .collect();
        versions.sort_by_key(|v| v.model.number);

        let numbers = versions
            .iter()
            .map(|v| (v.id::<VersionId>(), v.model.number))
            .collect();

        let entries = RepositoryContent::load_all(view)?
            .into_iter()
            .filter(|e| &e.model.repository == repository)
            .collect();

        Ok(Self {
            repository: repository.clone(),
            versions,
            numbers,
            entries,
        })
    }

    pub fn repository(&self) -> &RepositoryId {
        &self.repository
    }

    pub fn entries(&self) -> &[Stored<RepositoryContent>] {
        &self.entries
    }

    pub fn versions(&self) -> &[Stored<RepositoryVersion>] {
        &self.versions
    }

    pub fn number_of(&self, version: &VersionId) -> Option<u64> {
        self.numbers.get(version).copied()
    }

    /// version row by number, complete or not
    pub fn version(&self, number: u64) -> Option<&Stored<RepositoryVersion>> {
        self.versions.iter().find(|v| v.model.number == number)
    }

    pub fn version_by_id(&self, id: &VersionId) -> Option<&Stored<RepositoryVersion>> {
        self.versions.iter().find(|v| v.key() == id.key())
    }

    pub fn complete_versions(&self) -> impl Iterator<Item = &Stored<RepositoryVersion>> {
        self.versions.iter().filter(|v| v.model.complete)
    }

    pub fn incomplete_versions(&self) -> impl Iterator<Item = &Stored<RepositoryVersion>> {
        self.versions.iter().filter(|v| !v.model.complete)
    }

    /// lowest-numbered complete version after `number`
    pub fn next_complete(&self, number: u64) -> Option<&Stored<RepositoryVersion>> {
        self.complete_versions().find(|v| v.model.number > number)
    }

    pub fn latest_complete(&self) -> Option<&Stored<RepositoryVersion>> {
        self.complete_versions().last()
    }

    /// Content present at version `number`: added at or before it and not
    /// removed at or before it.
    pub fn content_at(&self, number: u64) -> ContentSet {
        self.entries
            .iter()
            .filter(|e| self.present_at(&e.model, number))
            .map(|e| e.model.content())
            .collect()
    }

    fn present_at(&self, entry: &RepositoryContent, number: u64) -> bool {
        let added = match self.number_of(&entry.version_added) {
            Some(added) => added,
            None => return false,
        };
        if added > number {
            return false;
        }
        match &entry.version_removed {
            None => true,
            Some(removed) => self.number_of(removed).is_some_and(|removed| removed > number),
        }
    }

    pub fn added_by(&self, version: &VersionId) -> ContentSet {
        self.entries_added_by(version).map(|e| e.model.content()).collect()
    }

    pub fn removed_by(&self, version: &VersionId) -> ContentSet {
        self.entries_removed_by(version).map(|e| e.model.content()).collect()
    }

    pub fn entries_added_by<'a>(&'a self, version: &'a VersionId) -> impl Iterator<Item = &'a Stored<RepositoryContent>> {
        self.entries.iter().filter(move |e| &e.model.version_added == version)
    }

    pub fn entries_removed_by<'a>(
        &'a self,
        version: &'a VersionId,
    ) -> impl Iterator<Item = &'a Stored<RepositoryContent>> {
        self.entries
            .iter()
            .filter(move |e| e.model.version_removed.as_ref() == Some(version))
    }

    /// every reference with an open entry
    pub fn active(&self) -> ContentSet {
        self.entries
            .iter()
            .filter(|e| e.model.is_active())
            .map(|e| e.model.content())
            .collect()
    }

    fn active_entry(&self, content: &ContentRef) -> Option<&Stored<RepositoryContent>> {
        self.entries
            .iter()
            .find(|e| e.model.is_active() && &e.model.content() == content)
    }
}

/// Open one entry per reference added by `version`.
///
/// References already in the version's content are skipped. Returns the
/// number of entries written; everything lands in a single commit.
pub fn add_entries(
    tx: &mut Transaction<TxActive>,
    repository: &RepositoryId,
    version: &VersionId,
    content: &ContentSet,
) -> VersionResult<usize> {
    let ledger = Ledger::load(&*tx, repository)?;
    let number = version_number(&ledger, version)?;

    let missing = content.difference(&ledger.content_at(number));
    if missing.is_empty() {
        return Ok(0);
    }

    let mut batch = WriteBatch::new(format!("add content to version {}", number));
    for content in missing.iter() {
        check_add(&ledger, version, &content)?;
        let entry = RepositoryContent {
            repository: repository.clone(),
            content_type: content.content_type,
            content_id: content.id,
            version_added: version.clone(),
            version_removed: None,
        };
        entry.stage_insert(&mut batch, EntryId::generate().key().clone())?;
    }

    let added = batch.puts();
    tx.apply(&batch)?;
    tracing::debug!(repository = %repository, number, added, "ledger entries added");
    Ok(added)
}

/// Close the open entry of every reference removed by `version`.
///
/// References without an open entry are ignored. An entry opened by the
/// same version is dropped instead of closed, since it never existed
/// outside the version being built.
pub fn close_entries(
    tx: &mut Transaction<TxActive>,
    repository: &RepositoryId,
    version: &VersionId,
    content: &ContentSet,
) -> VersionResult<usize> {
    let ledger = Ledger::load(&*tx, repository)?;
    let number = version_number(&ledger, version)?;

    let mut batch = WriteBatch::new(format!("remove content from version {}", number));
    let mut closed = 0;
    for content in content.iter() {
        let Some(entry) = ledger.active_entry(&content) else {
            continue;
        };

        if &entry.model.version_added == version {
            entry.stage_delete(&mut batch);
        } else {
            check_remove(&ledger, version, &content)?;
            let mut entry = entry.clone();
            entry.model.version_removed = Some(version.clone());
            entry.stage_update(&mut batch)?;
        }
        closed += 1;
    }

    tx.apply(&batch)?;
    if closed > 0 {
        tracing::debug!(repository = %repository, number, closed, "ledger entries closed");
    }
    Ok(closed)
}

fn version_number(ledger: &Ledger, version: &VersionId) -> VersionResult<u64> {
    ledger
        .number_of(version)
        .ok_or_else(|| VersionError::ConstraintViolation(format!("ledger entry for unknown version {}", version)))
}

/// a unit may be opened once per version and never twice at the same time
fn check_add(ledger: &Ledger, version: &VersionId, content: &ContentRef) -> VersionResult<()> {
    let twice = ledger
        .entries_added_by(version)
        .any(|e| &e.model.content() == content);
    if twice || ledger.active_entry(content).is_some() {
        return Err(VersionError::ConstraintViolation(format!(
            "{} would have two open entries in repository {}",
            content,
            ledger.repository()
        )));
    }
    Ok(())
}

fn check_remove(ledger: &Ledger, version: &VersionId, content: &ContentRef) -> VersionResult<()> {
    if ledger
        .entries_removed_by(version)
        .any(|e| &e.model.content() == content)
    {
        return Err(VersionError::ConstraintViolation(format!(
            "{} removed twice by the same version",
            content
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentId, ContentType, Repository};
    use crate::storage::GitStore;
    use crate::transaction::TransactionManager;
    use tempfile::TempDir;

    fn cref(id: &str) -> ContentRef {
        ContentRef::new(ContentType::new("file.file").unwrap(), ContentId::new(id).unwrap())
    }

    fn set(ids: &[&str]) -> ContentSet {
        ids.iter().map(|id| cref(id)).collect()
    }

    /// a repository with `count` version rows numbered from 1
    fn setup(count: u64) -> (TempDir, TransactionManager, RepositoryId, Vec<VersionId>) {
        let dir = TempDir::new().unwrap();
        let manager = TransactionManager::new(GitStore::init(dir.path()).unwrap());
        let repository = RepositoryId::generate();
        let versions: Vec<VersionId> = (0..count).map(|_| VersionId::generate()).collect();

        let mut batch = WriteBatch::new("setup");
        Repository {
            name: "ledger".to_string(),
            description: None,
            last_version: count,
        }
        .stage_insert(&mut batch, repository.key().clone())
        .unwrap();
        for (i, id) in versions.iter().enumerate() {
            RepositoryVersion {
                repository: repository.clone(),
                number: i as u64 + 1,
                complete: true,
                base_version: None,
            }
            .stage_insert(&mut batch, id.key().clone())
            .unwrap();
        }
        manager.with_transaction(|tx| tx.apply(&batch)).unwrap();

        (dir, manager, repository, versions)
    }

    fn ledger(manager: &TransactionManager, repository: &RepositoryId) -> Ledger {
        let snapshot = crate::transaction::Snapshot::head(manager.store().clone()).unwrap();
        Ledger::load(&snapshot, repository).unwrap()
    }

    #[test]
    fn test_add_skips_present_content() {
        let (_dir, manager, repo, v) = setup(2);

        let added: VersionResult<usize> =
            manager.with_transaction_isolation(manager.isolation(), |tx| add_entries(tx, &repo, &v[0], &set(&["a", "b"])));
        assert_eq!(added.unwrap(), 2);

        let added: VersionResult<usize> =
            manager.with_transaction_isolation(manager.isolation(), |tx| add_entries(tx, &repo, &v[1], &set(&["b", "c"])));
        assert_eq!(added.unwrap(), 1);

        let ledger = ledger(&manager, &repo);
        assert_eq!(ledger.content_at(1), set(&["a", "b"]));
        assert_eq!(ledger.content_at(2), set(&["a", "b", "c"]));
        assert_eq!(ledger.added_by(&v[1]), set(&["c"]));
    }

    #[test]
    fn test_close_ignores_inactive() {
        let (_dir, manager, repo, v) = setup(2);

        let _: usize = manager
            .with_transaction_isolation::<_, _, VersionError>(manager.isolation(), |tx| {
                add_entries(tx, &repo, &v[0], &set(&["a", "b"]))
            })
            .unwrap();
        let closed: usize = manager
            .with_transaction_isolation::<_, _, VersionError>(manager.isolation(), |tx| {
                close_entries(tx, &repo, &v[1], &set(&["a", "zzz"]))
            })
            .unwrap();
        assert_eq!(closed, 1);

        let ledger = ledger(&manager, &repo);
        assert_eq!(ledger.content_at(1), set(&["a", "b"]));
        assert_eq!(ledger.content_at(2), set(&["b"]));
        assert_eq!(ledger.removed_by(&v[1]), set(&["a"]));
        assert_eq!(ledger.active(), set(&["b"]));
    }

    #[test]
    fn test_remove_then_readd_in_same_version() {
        let (_dir, manager, repo, v) = setup(2);

        manager
            .with_transaction_isolation::<_, _, VersionError>(manager.isolation(), |tx| {
                add_entries(tx, &repo, &v[0], &set(&["a"]))?;
                close_entries(tx, &repo, &v[1], &set(&["a"]))?;
                add_entries(tx, &repo, &v[1], &set(&["a"]))
            })
            .unwrap();

        let ledger = ledger(&manager, &repo);
        assert_eq!(ledger.content_at(1), set(&["a"]));
        assert_eq!(ledger.content_at(2), set(&["a"]));
        assert_eq!(ledger.entries().len(), 2);
    }

    #[test]
    fn test_add_then_remove_in_same_version_leaves_no_row() {
        let (_dir, manager, repo, v) = setup(1);

        manager
            .with_transaction_isolation::<_, _, VersionError>(manager.isolation(), |tx| {
                add_entries(tx, &repo, &v[0], &set(&["a"]))?;
                close_entries(tx, &repo, &v[0], &set(&["a"]))
            })
            .unwrap();

        let ledger = ledger(&manager, &repo);
        assert!(ledger.entries().is_empty());
        assert!(ledger.content_at(1).is_empty());
    }

    #[test]
    fn test_next_and_latest_skip_incomplete() {
        let (_dir, manager, repo, _) = setup(2);

        let mut batch = WriteBatch::new("incomplete");
        RepositoryVersion {
            repository: repo.clone(),
            number: 3,
            complete: false,
            base_version: None,
        }
        .stage_insert(&mut batch, VersionId::generate().key().clone())
        .unwrap();
        manager.with_transaction(|tx| tx.apply(&batch)).unwrap();

        let ledger = ledger(&manager, &repo);
        assert_eq!(ledger.next_complete(1).unwrap().model.number, 2);
        assert!(ledger.next_complete(2).is_none());
        assert_eq!(ledger.latest_complete().unwrap().model.number, 2);
        assert_eq!(ledger.incomplete_versions().count(), 1);
    }
}
