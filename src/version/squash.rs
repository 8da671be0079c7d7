//! Version deletion.
//!
//! Deleting a version must leave the content of every other version exactly
//! as it was. Three cases:
//!
//! - incomplete version: undo the build without a trace
//! - complete version with a successor: squash its ledger changes into the
//!   successor
//! - latest complete version: drop its changes, reopening what it removed
//!
//! Each deletion runs as one transaction and lands as one commit.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::model::{CreatedResource, Model, Repository, RepositoryContent, RepositoryId, RepositoryVersion, Stored, VersionId};
use crate::storage::{RecordKey, WriteBatch};
use crate::transaction::{Snapshot, Transaction, TransactionManager, TxActive};
use crate::version::error::{VersionError, VersionResult};
use crate::version::ledger::Ledger;

/// What deleting a version amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Deletion {
    /// an unfinished build was rolled back
    Discarded,
    /// changes were folded into the successor with this number
    Squashed { into: u64 },
    /// the latest version was removed
    Dropped,
}

#[derive(Debug, Clone)]
pub struct VersionDeleter {
    manager: TransactionManager,
    max_attempts: u32,
}

impl VersionDeleter {
    pub fn new(manager: TransactionManager) -> Self {
        Self {
            manager,
            max_attempts: 1,
        }
    }

    /// retry a deletion that lost a commit race up to `attempts` times
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delete version `number` of `repository`.
    pub fn delete_version(&self, repository: &RepositoryId, number: u64) -> VersionResult<Deletion> {
        let deletion = self.manager.with_retries(self.max_attempts, VersionError::is_retryable, |tx| {
            let ledger = Ledger::load(&*tx, repository)?;
            let version = ledger
                .version(number)
                .ok_or_else(|| VersionError::VersionNotFound {
                    repository: repository.clone(),
                    number,
                })?
                .clone();
            delete_in(tx, &ledger, &version)
        })?;

        tracing::info!(repository = %repository, number, ?deletion, "version deleted");
        Ok(deletion)
    }

    /// Roll back an unfinished build.
    ///
    /// A version that no longer exists is treated as already discarded.
    pub fn discard(&self, repository: &RepositoryId, version: &VersionId) -> VersionResult<()> {
        let number = self.manager.with_retries(self.max_attempts, VersionError::is_retryable, |tx| {
            let ledger = Ledger::load(&*tx, repository)?;
            let Some(stored) = ledger.version_by_id(version).cloned() else {
                return Ok(None);
            };
            if stored.model.complete {
                return Err(VersionError::ImmutableVersion {
                    repository: repository.clone(),
                    number: stored.model.number,
                });
            }
            delete_in(tx, &ledger, &stored)?;
            Ok(Some(stored.model.number))
        })?;

        if let Some(number) = number {
            tracing::info!(repository = %repository, number, "incomplete version discarded");
        }
        Ok(())
    }

    /// Discard every incomplete version of a repository, e.g. after a crash
    /// interrupted a build. Returns the discarded numbers.
    pub fn cleanup_incomplete(&self, repository: &RepositoryId) -> VersionResult<Vec<u64>> {
        let ledger = Ledger::load(&Snapshot::head(self.manager.store().clone())?, repository)?;
        let stale: Vec<(VersionId, u64)> = ledger
            .incomplete_versions()
            .map(|v| (v.id(), v.model.number))
            .collect();

        let mut discarded = Vec::new();
        // newest first so the version counter can be rolled back each time
        for (version, number) in stale.into_iter().rev() {
            self.discard(repository, &version)?;
            discarded.push(number);
        }

        if !discarded.is_empty() {
            tracing::warn!(repository = %repository, ?discarded, "cleaned up incomplete versions");
        }
        Ok(discarded)
    }
}

/// Stage and apply the deletion of `version` inside `tx`.
pub(crate) fn delete_in(
    tx: &mut Transaction<TxActive>,
    ledger: &Ledger,
    version: &Stored<RepositoryVersion>,
) -> VersionResult<Deletion> {
    let id: VersionId = version.id();
    let number = version.model.number;
    let mut batch = WriteBatch::new(format!("delete version {}", number));

    let deletion = if !version.model.complete {
        stage_drop(ledger, &id, &mut batch)?;
        stage_counter_rollback(tx, ledger.repository(), number, &mut batch)?;
        Deletion::Discarded
    } else if let Some(successor) = ledger.next_complete(number) {
        stage_squash(ledger, &id, &successor.id(), &mut batch)?;
        Deletion::Squashed {
            into: successor.model.number,
        }
    } else {
        stage_drop(ledger, &id, &mut batch)?;
        Deletion::Dropped
    };

    // versions built on this one lose their base
    for other in ledger.versions() {
        if other.model.base_version.as_ref() == Some(&id) {
            let mut other = other.clone();
            other.model.base_version = None;
            other.stage_update(&mut batch)?;
        }
    }

    for marker in CreatedResource::load_all(&*tx)? {
        if marker.model.version == id {
            marker.stage_delete(&mut batch);
        }
    }

    version.stage_delete(&mut batch);
    tx.apply(&batch)?;
    Ok(deletion)
}

/// Undo the ledger changes of `version`: entries it opened go away and
/// entries it closed are reopened.
fn stage_drop(ledger: &Ledger, version: &VersionId, batch: &mut WriteBatch) -> VersionResult<()> {
    let mut dropped = HashSet::new();
    for entry in ledger.entries_added_by(version) {
        entry.stage_delete(batch);
        dropped.insert(entry.key().clone());
    }

    for entry in ledger.entries_removed_by(version) {
        if dropped.contains(entry.key()) {
            continue;
        }
        let content = entry.model.content();
        let reopened_elsewhere = ledger
            .entries()
            .iter()
            .any(|e| e.model.is_active() && e.model.content() == content && !dropped.contains(e.key()));
        if reopened_elsewhere {
            return Err(VersionError::ConstraintViolation(format!(
                "{} already has an open entry in {}",
                content,
                ledger.repository()
            )));
        }

        let mut entry = entry.clone();
        entry.model.version_removed = None;
        entry.stage_update(batch)?;
    }
    Ok(())
}

/// Fold the ledger changes of `version` into `successor`.
fn stage_squash(
    ledger: &Ledger,
    version: &VersionId,
    successor: &VersionId,
    batch: &mut WriteBatch,
) -> VersionResult<()> {
    let mut deleted: HashSet<RecordKey> = HashSet::new();
    let mut changed: BTreeMap<RecordKey, Stored<RepositoryContent>> = BTreeMap::new();

    // content that only existed between the two versions
    for entry in ledger.entries_added_by(version) {
        if entry.model.version_removed.as_ref() == Some(successor) {
            deleted.insert(entry.key().clone());
        }
    }

    // removed here and re-added by the successor: one continuous entry
    for removed in ledger.entries_removed_by(version) {
        let content = removed.model.content();
        let readded = ledger
            .entries_added_by(successor)
            .find(|e| e.model.content() == content && !deleted.contains(e.key()));

        if let Some(readded) = readded {
            let mut kept = removed.clone();
            kept.model.version_removed = readded.model.version_removed.clone();
            changed.insert(kept.key().clone(), kept);
            deleted.insert(readded.key().clone());
        }
    }

    // everything else moves to the successor
    for entry in ledger.entries() {
        if deleted.contains(entry.key()) {
            continue;
        }

        let (mut current, mut dirty) = match changed.remove(entry.key()) {
            Some(kept) => (kept, true),
            None => (entry.clone(), false),
        };

        if &current.model.version_added == version {
            current.model.version_added = successor.clone();
            dirty = true;
        }
        if current.model.version_removed.as_ref() == Some(version) {
            current.model.version_removed = Some(successor.clone());
            dirty = true;
        }

        if dirty {
            current.stage_update(batch)?;
        }
    }

    for key in deleted {
        RepositoryContent::stage_delete(batch, key);
    }

    tracing::debug!(
        repository = %ledger.repository(),
        from = %version,
        into = %successor,
        "squashed ledger entries"
    );
    Ok(())
}

/// Give the number back if it was the last one issued.
fn stage_counter_rollback(
    tx: &Transaction<TxActive>,
    repository: &RepositoryId,
    number: u64,
    batch: &mut WriteBatch,
) -> VersionResult<()> {
    let Some(mut repo) = Repository::load(tx, repository.key())? else {
        return Ok(());
    };

    if repo.model.last_version == number {
        repo.model.last_version = number - 1;
        repo.stage_update(batch)?;
    } else {
        tracing::warn!(
            repository = %repository,
            number,
            last_version = repo.model.last_version,
            "newer version issued, keeping version counter"
        );
    }
    Ok(())
}
