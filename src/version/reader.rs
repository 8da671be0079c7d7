//! Point-in-time queries over repository versions.
//!
//! Only complete versions are visible here. Every query works against any
//! [`ReadView`], so it can run on a snapshot of main or inside a transaction.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{ContentRef, ContentSet, ContentType, Model, Repository, RepositoryId, RepositoryVersion, Stored, VersionId};
use crate::transaction::ReadView;
use crate::version::error::{VersionError, VersionResult};
use crate::version::ledger::Ledger;

/// A version as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub repository: RepositoryId,
    pub id: VersionId,
    pub number: u64,
    /// number of the base version, if it still exists
    pub base_version: Option<u64>,
    pub created_at: String,
}

impl VersionInfo {
    pub(crate) fn new(ledger: &Ledger, version: &Stored<RepositoryVersion>) -> Self {
        Self {
            repository: version.model.repository.clone(),
            id: version.id(),
            number: version.model.number,
            base_version: version
                .model
                .base_version
                .as_ref()
                .and_then(|base| ledger.number_of(base)),
            created_at: version.created_at().to_string(),
        }
    }
}

pub struct VersionReader<V> {
    view: V,
}

impl<V: ReadView> VersionReader<V> {
    pub fn new(view: V) -> Self {
        Self { view }
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    /// Load the ledger of an existing repository.
    pub fn ledger(&self, repository: &RepositoryId) -> VersionResult<Ledger> {
        if Repository::load(&self.view, repository.key())?.is_none() {
            return Err(VersionError::RepositoryNotFound(repository.to_string()));
        }
        Ledger::load(&self.view, repository)
    }

    fn complete<'a>(
        &self,
        ledger: &'a Ledger,
        number: u64,
    ) -> VersionResult<&'a Stored<RepositoryVersion>> {
        ledger
            .version(number)
            .filter(|v| v.model.complete)
            .ok_or_else(|| VersionError::VersionNotFound {
                repository: ledger.repository().clone(),
                number,
            })
    }

    pub fn get_version(&self, repository: &RepositoryId, number: u64) -> VersionResult<VersionInfo> {
        let ledger = self.ledger(repository)?;
        let version = self.complete(&ledger, number)?;
        Ok(VersionInfo::new(&ledger, version))
    }

    /// Complete versions, oldest first.
    pub fn list_versions(&self, repository: &RepositoryId) -> VersionResult<Vec<VersionInfo>> {
        let ledger = self.ledger(repository)?;
        Ok(ledger
            .complete_versions()
            .map(|v| VersionInfo::new(&ledger, v))
            .collect())
    }

    pub fn content_at(&self, repository: &RepositoryId, number: u64) -> VersionResult<ContentSet> {
        let ledger = self.ledger(repository)?;
        self.complete(&ledger, number)?;
        Ok(ledger.content_at(number))
    }

    /// Content whose entry was opened by this version, whether or not a
    /// later version removed it again.
    pub fn added_by(&self, repository: &RepositoryId, number: u64) -> VersionResult<ContentSet> {
        let ledger = self.ledger(repository)?;
        let version: VersionId = self.complete(&ledger, number)?.id();
        Ok(ledger.added_by(&version))
    }

    pub fn removed_by(&self, repository: &RepositoryId, number: u64) -> VersionResult<ContentSet> {
        let ledger = self.ledger(repository)?;
        let version: VersionId = self.complete(&ledger, number)?.id();
        Ok(ledger.removed_by(&version))
    }

    pub fn contains(&self, repository: &RepositoryId, number: u64, content: &ContentRef) -> VersionResult<bool> {
        Ok(self.content_at(repository, number)?.contains(content))
    }

    /// Count of content units per type.
    pub fn summary(&self, repository: &RepositoryId, number: u64) -> VersionResult<BTreeMap<ContentType, usize>> {
        Ok(self.content_at(repository, number)?.counts())
    }

    /// The lowest-numbered complete version after `number`.
    pub fn next(&self, repository: &RepositoryId, number: u64) -> VersionResult<VersionInfo> {
        let ledger = self.ledger(repository)?;
        if ledger.version(number).is_none() {
            return Err(VersionError::VersionNotFound {
                repository: repository.clone(),
                number,
            });
        }

        ledger
            .next_complete(number)
            .map(|v| VersionInfo::new(&ledger, v))
            .ok_or_else(|| VersionError::NoSuccessor {
                repository: repository.clone(),
                number,
            })
    }

    /// The highest-numbered complete version, if any.
    pub fn latest(&self, repository: &RepositoryId) -> VersionResult<Option<VersionInfo>> {
        let ledger = self.ledger(repository)?;
        Ok(ledger.latest_complete().map(|v| VersionInfo::new(&ledger, v)))
    }

    /// Numbers of the complete versions that hold `content`.
    pub fn versions_containing(&self, repository: &RepositoryId, content: &ContentRef) -> VersionResult<Vec<u64>> {
        let ledger = self.ledger(repository)?;
        Ok(ledger
            .complete_versions()
            .map(|v| v.model.number)
            .filter(|&number| ledger.content_at(number).contains(content))
            .collect())
    }
}
