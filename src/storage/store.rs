//! The Git-backed record store.
//!
//! Every table is a directory of the commit tree and every record a JSON
//! blob inside it. Writes never touch a branch directly: a [`WriteBatch`]
//! is applied on top of a given commit and yields a new one, and the
//! caller decides which branch to move.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Repository;
use parking_lot::{Mutex, RwLock};

use crate::storage::batch::{BatchOp, WriteBatch};
use crate::storage::blob::{self, Record};
use crate::storage::commit::{self, CommitInfo, CommitMessage, NewCommit};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::refs::RefManager;
use crate::storage::types::{BranchName, CommitId, GitSignature, RecordKey, TableName};

/// Shared handle to one store directory. Cheap to clone.
#[derive(Clone)]
pub struct GitStore {
    inner: Arc<GitStoreInner>,
}

struct GitStoreInner {
    /// git2 handles are Send but not Sync, so access is serialized
    repo: Mutex<Repository>,
    path: PathBuf,
    signature: RwLock<GitSignature>,
}

impl GitStore {
    fn wrap(repo: Repository, path: &Path) -> Self {
        Self {
            inner: Arc::new(GitStoreInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                signature: RwLock::new(GitSignature::contentdb()),
            }),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;
        Ok(Self::wrap(repo, path))
    }

    /// Create the directory's repository with an empty root commit on `main`.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let store = Self::wrap(Repository::init(path)?, path);

        let signature = store.signature();
        store.with_repo(|repo| {
            let root = commit::create_initial_commit(repo, &signature)?;
            RefManager::init_main_branch(repo, root)
        })?;
        tracing::debug!(path = %path.display(), "initialized store");

        Ok(store)
    }

    pub fn open_or_init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join(".git").exists() {
            Self::open(path)
        } else {
            Self::init(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn signature(&self) -> GitSignature {
        self.inner.signature.read().clone()
    }

    pub fn set_signature(&self, signature: GitSignature) {
        *self.inner.signature.write() = signature;
    }

    /// Run `f` with the repository locked.
    fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    /// Tip of `main`.
    pub fn head(&self) -> StorageResult<CommitId> {
        self.with_repo(RefManager::head_commit)
    }

    pub fn get_commit(&self, id: CommitId) -> StorageResult<CommitInfo> {
        self.with_repo(|repo| commit::get_commit(repo, id))
    }

    pub fn list_tables(&self, at: CommitId) -> StorageResult<Vec<TableName>> {
        self.with_repo(|repo| Ok(commit::get_tree_at_commit(repo, at)?.list_tables()))
    }

    pub fn table_exists(&self, table: &TableName, at: CommitId) -> StorageResult<bool> {
        self.with_repo(|repo| Ok(commit::get_tree_at_commit(repo, at)?.table_exists(table)))
    }

    pub fn read_record(&self, table: &TableName, key: &RecordKey, at: CommitId) -> StorageResult<Option<Record>> {
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, at)?;
            match tree.get_record_blob_id(repo, table, key)? {
                Some(blob_id) => {
                    let bytes = blob::read_blob(repo, blob_id)?;
                    Ok(Some(blob::deserialize_record(&bytes, key)?))
                }
                None => Ok(None),
            }
        })
    }

    /// Read every record of a table; a missing table reads as empty.
    pub fn scan_table(&self, table: &TableName, at: CommitId) -> StorageResult<Vec<Record>> {
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, at)?;
            if !tree.table_exists(table) {
                return Ok(Vec::new());
            }

            tree.list_record_blobs(repo, table)?
                .into_iter()
                .map(|(key, blob_id)| {
                    let bytes = blob::read_blob(repo, blob_id)?;
                    blob::deserialize_record(&bytes, &key)
                })
                .collect()
        })
    }

    /// Apply a whole batch on top of `at` as one commit and return it.
    ///
    /// No ref moves. An empty batch returns `at` unchanged, and a batch that
    /// fails halfway leaves nothing behind.
    pub fn apply_batch(&self, batch: &WriteBatch, at: CommitId, tx_id: Option<&str>) -> StorageResult<CommitId> {
        if batch.is_empty() {
            return Ok(at);
        }

        let message = CommitMessage::batch(batch.label(), batch.puts(), batch.deletes(), tx_id);
        let signature = self.signature();
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, at)?;
            let mut mutator = tree.mutate(repo)?;
            for op in batch.ops() {
                match op {
                    BatchOp::EnsureTable(table) => {
                        if !mutator.contains_table(table) {
                            mutator.create_table(table)?;
                        }
                    }
                    BatchOp::Put { table, record } => {
                        let blob_id = blob::write_blob(repo, record)?;
                        mutator.upsert_record(table, &record.key, blob_id)?;
                    }
                    BatchOp::Delete { table, key } => mutator.delete_record(table, key)?,
                }
            }

            NewCommit {
                tree: mutator.write()?,
                parent: Some(at),
                message: &message,
                signature: &signature,
            }
            .write(repo, None)
        })
    }

    // transaction branches

    pub fn update_branch(&self, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        self.with_repo(|repo| RefManager::update_branch(repo, branch, target))
    }

    pub fn branch_exists(&self, branch: &BranchName) -> StorageResult<bool> {
        self.with_repo(|repo| Ok(RefManager::branch_exists(repo, branch)))
    }

    pub fn list_transaction_branches(&self) -> StorageResult<Vec<BranchName>> {
        self.with_repo(RefManager::list_transaction_branches)
    }

    pub fn create_transaction_branch(&self, tx_id: &str, base: CommitId) -> StorageResult<BranchName> {
        self.with_repo(|repo| RefManager::create_transaction_branch(repo, tx_id, base))
    }

    pub fn delete_transaction_branch(&self, tx_id: &str) -> StorageResult<()> {
        self.with_repo(|repo| RefManager::delete_transaction_branch(repo, tx_id))
    }

    /// Move `main` to the tip of `tx_branch`, provided it still points at
    /// `expected_main`.
    pub fn fast_forward_main(&self, tx_branch: &BranchName, expected_main: CommitId) -> StorageResult<CommitId> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve_branch(repo, tx_branch)?;
            RefManager::update_branch_if_unchanged(repo, &BranchName::main(), expected_main, tip)?;
            Ok(tip)
        })
    }

    /// Record paths touched both on `tx_branch` and on `main_head` since
    /// the two split.
    pub fn detect_conflicts(&self, tx_branch: &BranchName, main_head: CommitId) -> StorageResult<Vec<PathBuf>> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve_branch(repo, tx_branch)?;
            commit::detect_conflicts(repo, tip, main_head)
        })
    }

    /// Commit log, newest first.
    pub fn history(&self, from: CommitId, limit: Option<usize>) -> StorageResult<Vec<CommitInfo>> {
        self.with_repo(|repo| {
            let commits = commit::history(repo, from)?;
            commits.take(limit.unwrap_or(usize::MAX)).collect()
        })
    }

    pub fn stats(&self, at: CommitId) -> StorageResult<StoreStats> {
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, at)?;
            let tables = tree.list_tables();
            let mut total_records = 0;
            for table in &tables {
                total_records += tree.list_records(repo, table)?.len();
            }

            Ok(StoreStats {
                table_count: tables.len(),
                total_records,
                active_transactions: RefManager::list_transaction_branches(repo)?.len(),
            })
        })
    }
}

impl std::fmt::Debug for GitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitStore").field("path", &self.inner.path).finish()
    }
}

/// Record counts at one commit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub table_count: usize,
    pub total_records: usize,
    /// transaction branches still present; non-zero while writers run or after a crash
    pub active_transactions: usize,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tables, {} records, {} open transactions",
            self.table_count, self.total_records, self.active_transactions
        )
    }
}
