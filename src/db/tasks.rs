//! Job runner for repository operations.
//!
//! Each mutating job on a repository holds that repository's lock for its
//! whole run, so builds and deletions of one repository never interleave.
//! Jobs that fail on a lost commit race are re-run from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::db::api::{ContentStore, RepositoryInfo, RepositoryUpdate};
use crate::db::error::{StoreError, StoreResult};
use crate::model::{ContentSet, CreatedResource, RepositoryId};
use crate::orphan::ReclaimReport;
use crate::version::{Deletion, VersionError, VersionInfo};

/// A unit of work.
#[derive(Debug, Clone)]
pub enum Job {
    AddAndRemove {
        repository: String,
        base_version: Option<u64>,
        add: ContentSet,
        remove: ContentSet,
    },
    DeleteVersion {
        repository: String,
        number: u64,
    },
    DeleteRepository {
        repository: String,
    },
    UpdateRepository {
        repository: String,
        update: RepositoryUpdate,
    },
    ReclaimOrphans,
}

impl Job {
    pub fn repository(&self) -> Option<&str> {
        match self {
            Job::AddAndRemove { repository, .. }
            | Job::DeleteVersion { repository, .. }
            | Job::DeleteRepository { repository }
            | Job::UpdateRepository { repository, .. } => Some(repository),
            Job::ReclaimOrphans => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Job::AddAndRemove { .. } => "add_and_remove",
            Job::DeleteVersion { .. } => "delete_version",
            Job::DeleteRepository { .. } => "delete_repository",
            Job::UpdateRepository { .. } => "update_repository",
            Job::ReclaimOrphans => "reclaim_orphans",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResult {
    Version(VersionInfo),
    /// `None` when the version was already gone
    Deleted { deletion: Option<Deletion> },
    Repository(RepositoryInfo),
    Reclaimed(ReclaimReport),
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job: &'static str,
    pub attempts: u32,
    pub result: JobResult,
    /// versions the job produced
    pub created_resources: Vec<CreatedResource>,
}

pub struct TaskRunner {
    store: ContentStore,
    max_retries: u32,
    locks: Mutex<HashMap<RepositoryId, Arc<Mutex<()>>>>,
}

impl TaskRunner {
    pub fn new(store: ContentStore) -> Self {
        let max_retries = store.config().max_retries;
        Self {
            store,
            max_retries,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    fn lock_for(&self, repository: &RepositoryId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(repository.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a job to completion, retrying it while it fails on a lost race.
    pub fn run(&self, job: &Job) -> StoreResult<JobOutcome> {
        let repository = match job.repository() {
            Some(name) => Some(self.store.repository_id(name)?),
            None => None,
        };
        let lock = repository.as_ref().map(|id| self.lock_for(id));
        let _guard = lock.as_ref().map(|lock| lock.lock());

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.execute(job) {
                Ok((result, created_resources)) => {
                    if let (Job::DeleteRepository { .. }, Some(id)) = (job, &repository) {
                        self.locks.lock().remove(id);
                    }
                    tracing::info!(job = job.name(), attempts, "job finished");
                    return Ok(JobOutcome {
                        job: job.name(),
                        attempts,
                        result,
                        created_resources,
                    });
                }
                Err(e) if e.is_retryable() && attempts < self.max_retries => {
                    tracing::warn!(job = job.name(), attempts, error = %e, "job failed, retrying");
                }
                Err(e) => {
                    tracing::error!(job = job.name(), attempts, error = %e, status = %e.status(), "job failed");
                    return Err(e);
                }
            }
        }
    }

    fn execute(&self, job: &Job) -> StoreResult<(JobResult, Vec<CreatedResource>)> {
        match job {
            Job::AddAndRemove {
                repository,
                base_version,
                add,
                remove,
            } => {
                let info = self.store.add_and_remove(repository, *base_version, add, remove)?;
                let created = self
                    .store
                    .created_resources(repository)?
                    .into_iter()
                    .filter(|marker| marker.version == info.id)
                    .collect();
                Ok((JobResult::Version(info), created))
            }
            Job::DeleteVersion { repository, number } => match self.store.delete_version(repository, *number) {
                Ok(deletion) => Ok((JobResult::Deleted { deletion: Some(deletion) }, Vec::new())),
                // already gone is what the job wanted
                Err(StoreError::Version(VersionError::VersionNotFound { .. })) => {
                    tracing::info!(repository = %repository, number, "version not found, nothing to do");
                    Ok((JobResult::Deleted { deletion: None }, Vec::new()))
                }
                Err(e) => Err(e),
            },
            Job::DeleteRepository { repository } => {
                self.store.delete_repository(repository)?;
                Ok((JobResult::Done, Vec::new()))
            }
            Job::UpdateRepository { repository, update } => {
                let info = self.store.update_repository(repository, update)?;
                Ok((JobResult::Repository(info), Vec::new()))
            }
            Job::ReclaimOrphans => Ok((JobResult::Reclaimed(self.store.reclaim_orphans()?), Vec::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::db::StoreConfig;
    use crate::model::{ContentId, ContentRef, ContentType};

    fn runner() -> (TaskRunner, ContentRef) {
        let store = ContentStore::temporary_with_config(StoreConfig::default().max_retries(2)).unwrap();
        store.create_repository("files", None).unwrap();
        let a = store
            .create_content(&ContentType::new("file.file").unwrap(), Some(ContentId::new("a").unwrap()), BTreeMap::new())
            .unwrap();
        (TaskRunner::new(store), a)
    }

    #[test]
    fn test_add_and_remove_reports_created_version() {
        let (runner, a) = runner();
        let job = Job::AddAndRemove {
            repository: "files".to_string(),
            base_version: None,
            add: std::iter::once(a).collect(),
            remove: ContentSet::new(),
        };

        let outcome = runner.run(&job).unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.created_resources.len(), 1);
        assert_eq!(outcome.created_resources[0].number, 1);
        assert!(matches!(outcome.result, JobResult::Version(ref info) if info.number == 1));
    }

    #[test]
    fn test_delete_missing_version_is_a_noop() {
        let (runner, _) = runner();
        let job = Job::DeleteVersion {
            repository: "files".to_string(),
            number: 9,
        };

        let outcome = runner.run(&job).unwrap();
        assert_eq!(outcome.result, JobResult::Deleted { deletion: None });
    }

    #[test]
    fn test_unknown_repository_fails_without_retry() {
        let (runner, _) = runner();
        let err = runner
            .run(&Job::DeleteRepository {
                repository: "nope".to_string(),
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_deleting_a_repository_forgets_its_lock() {
        let (runner, a) = runner();
        runner
            .run(&Job::AddAndRemove {
                repository: "files".to_string(),
                base_version: None,
                add: std::iter::once(a).collect(),
                remove: ContentSet::new(),
            })
            .unwrap();
        assert_eq!(runner.locks.lock().len(), 1);

        runner
            .run(&Job::DeleteRepository {
                repository: "files".to_string(),
            })
            .unwrap();
        assert!(runner.locks.lock().is_empty());
    }

    #[test]
    fn test_concurrent_builds_get_distinct_numbers() {
        let (runner, a) = runner();
        let runner = Arc::new(runner);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let runner = runner.clone();
                let a = a.clone();
                std::thread::spawn(move || {
                    runner
                        .run(&Job::AddAndRemove {
                            repository: "files".to_string(),
                            base_version: None,
                            add: std::iter::once(a).collect(),
                            remove: ContentSet::new(),
                        })
                        .unwrap()
                })
            })
            .collect();
        let mut numbers: Vec<u64> = handles
            .into_iter()
            .map(|h| match h.join().unwrap().result {
                JobResult::Version(info) => info.number,
                other => panic!("unexpected result {:?}", other),
            })
            .collect();
        numbers.sort();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }
}
