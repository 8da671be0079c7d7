//! Commits and history.
//!
//! A write batch becomes exactly one commit. Transactions stack their
//! commits on a branch, and publishing one needs the ancestry checks below.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use git2::{Repository, Revwalk, Sort};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree::{self, TreeHandle};
use crate::storage::types::{CommitId, GitSignature, TreeId};

/// What `log` shows for one commit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommitInfo {
    #[serde(serialize_with = "as_display")]
    pub id: CommitId,
    #[serde(skip)]
    pub parents: Vec<CommitId>,
    /// `name <email>`
    pub author: String,
    pub time: DateTime<Utc>,
    pub message: String,
}

fn as_display<S: serde::Serializer>(id: &CommitId, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(id)
}

impl From<&git2::Commit<'_>> for CommitInfo {
    fn from(commit: &git2::Commit<'_>) -> Self {
        let sig = commit.author();
        Self {
            id: CommitId::new(commit.id()),
            parents: commit.parent_ids().map(CommitId::new).collect(),
            author: format!("{} <{}>", sig.name().unwrap_or("?"), sig.email().unwrap_or("?")),
            time: DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_default(),
            message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
        }
    }
}

impl CommitInfo {
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

/// A commit about to be written.
pub struct NewCommit<'m> {
    pub tree: TreeId,
    pub parent: Option<CommitId>,
    pub message: &'m str,
    pub signature: &'m GitSignature,
}

impl NewCommit<'_> {
    /// Write the commit object, moving `update_ref` to it when given.
    pub fn write(&self, repo: &Repository, update_ref: Option<&str>) -> StorageResult<CommitId> {
        let tree = repo.find_tree(self.tree.raw())?;
        let sig = self.signature.to_git2_signature()?;
        let parent = match self.parent {
            Some(id) => Some(find(repo, id)?),
            None => None,
        };
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

        let oid = repo.commit(update_ref, &sig, &sig, self.message, &tree, &parents)?;
        Ok(CommitId::new(oid))
    }
}

fn find(repo: &Repository, id: CommitId) -> StorageResult<git2::Commit<'_>> {
    repo.find_commit(id.raw())
        .map_err(|_| StorageError::CommitNotFound(id.to_string()))
}

pub fn get_commit(repo: &Repository, id: CommitId) -> StorageResult<CommitInfo> {
    Ok(CommitInfo::from(&find(repo, id)?))
}

pub fn get_tree_at_commit(repo: &Repository, id: CommitId) -> StorageResult<TreeHandle<'_>> {
    Ok(TreeHandle::new(find(repo, id)?.tree()?))
}

/// Root commit of a new store, written straight to `HEAD`.
pub fn create_initial_commit(repo: &Repository, signature: &GitSignature) -> StorageResult<CommitId> {
    NewCommit {
        tree: tree::create_initial_tree(repo)?,
        parent: None,
        message: "[contentdb] initialize store",
        signature,
    }
    .write(repo, Some("HEAD"))
}

/// Paths whose blobs differ between two commits.
pub fn changed_paths(repo: &Repository, old: CommitId, new: CommitId) -> StorageResult<Vec<PathBuf>> {
    let old_tree = repo.find_commit(old.raw())?.tree()?;
    let new_tree = repo.find_commit(new.raw())?.tree()?;
    let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;

    Ok(diff
        .deltas()
        .filter_map(|delta| {
            delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(PathBuf::from)
        })
        .collect())
}

/// Common ancestor of two commits, if they have one.
pub fn find_merge_base(repo: &Repository, a: CommitId, b: CommitId) -> StorageResult<Option<CommitId>> {
    repo.merge_base(a.raw(), b.raw())
        .map(|oid| Some(CommitId::new(oid)))
        .or_else(|e| match e.code() {
            git2::ErrorCode::NotFound => Ok(None),
            _ => Err(e.into()),
        })
}

/// Commits reachable from a starting point, newest first.
pub struct History<'repo> {
    repo: &'repo Repository,
    walk: Revwalk<'repo>,
}

impl Iterator for History<'_> {
    type Item = StorageResult<CommitInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.walk.next()?;
        Some(
            next.map_err(StorageError::from)
                .and_then(|oid| Ok(CommitInfo::from(&self.repo.find_commit(oid)?))),
        )
    }
}

pub fn history(repo: &Repository, start: CommitId) -> StorageResult<History<'_>> {
    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
    walk.push(start.raw())?;
    Ok(History { repo, walk })
}

/// Paths changed on both sides since `ours` and `theirs` split.
pub fn detect_conflicts(repo: &Repository, ours: CommitId, theirs: CommitId) -> StorageResult<Vec<PathBuf>> {
    let base = find_merge_base(repo, ours, theirs)?
        .ok_or_else(|| StorageError::Internal(format!("{} and {} share no history", ours.short(), theirs.short())))?;

    let ours: HashSet<PathBuf> = changed_paths(repo, base, ours)?.into_iter().collect();
    Ok(changed_paths(repo, base, theirs)?
        .into_iter()
        .filter(|path| ours.contains(path))
        .collect())
}

/// Commit message formats.
pub struct CommitMessage;

impl CommitMessage {
    /// one commit covering a whole write batch, tagged with its transaction
    pub fn batch(label: &str, puts: usize, deletes: usize, tx_id: Option<&str>) -> String {
        let body = format!("[BATCH] {} (+{} -{})", label, puts, deletes);
        match tx_id {
            Some(id) => format!("{} tx:{}", body, id),
            None => body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::create_initial_tree;
    use crate::storage::types::{BlobId, RecordKey, TableName};
    use tempfile::TempDir;

    fn fresh() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn commit_tree(repo: &Repository, tree: TreeId, parent: CommitId, message: &str) -> CommitId {
        let signature = GitSignature::contentdb();
        NewCommit {
            tree,
            parent: Some(parent),
            message,
            signature: &signature,
        }
        .write(repo, None)
        .unwrap()
    }

    fn child(repo: &Repository, parent: CommitId, message: &str) -> CommitId {
        commit_tree(repo, create_initial_tree(repo).unwrap(), parent, message)
    }

    #[test]
    fn test_root_commit() {
        let (_dir, repo) = fresh();
        let root = create_initial_commit(&repo, &GitSignature::contentdb()).unwrap();
        let info = get_commit(&repo, root).unwrap();

        assert_eq!(info.summary(), "[contentdb] initialize store");
        assert!(info.parents.is_empty());
        assert!(info.author.starts_with("contentdb <"));
        assert_eq!(repo.head().unwrap().target(), Some(root.raw()));
    }

    #[test]
    fn test_unknown_parent_is_reported() {
        let (_dir, repo) = fresh();
        let root = create_initial_commit(&repo, &GitSignature::contentdb()).unwrap();
        // a tree id is never a commit
        let bogus = CommitId::new(create_initial_tree(&repo).unwrap().raw());

        assert!(matches!(get_commit(&repo, bogus), Err(StorageError::CommitNotFound(_))));
        let signature = GitSignature::contentdb();
        let result = NewCommit {
            tree: create_initial_tree(&repo).unwrap(),
            parent: Some(bogus),
            message: "orphan",
            signature: &signature,
        }
        .write(&repo, None);
        assert!(matches!(result, Err(StorageError::CommitNotFound(_))));
        assert!(get_commit(&repo, root).unwrap().parents.is_empty());
    }

    #[test]
    fn test_history_is_newest_first() {
        let (_dir, repo) = fresh();
        let c1 = create_initial_commit(&repo, &GitSignature::contentdb()).unwrap();
        let c2 = child(&repo, c1, "second");
        let c3 = child(&repo, c2, "third");

        let ids: Vec<_> = history(&repo, c3)
            .unwrap()
            .map(|c| c.unwrap().id)
            .collect();
        assert_eq!(ids, vec![c3, c2, c1]);
        assert_eq!(get_commit(&repo, c3).unwrap().parents, vec![c2]);
    }

    #[test]
    fn test_conflicting_writes_to_one_record() {
        let (_dir, repo) = fresh();
        let base = create_initial_commit(&repo, &GitSignature::contentdb()).unwrap();
        let table = TableName::new("content").unwrap();
        let key = RecordKey::new("row1").unwrap();

        let commit_with = |payload: &[u8]| {
            let tree = get_tree_at_commit(&repo, base).unwrap();
            let mut mutator = tree.mutate(&repo).unwrap();
            mutator.create_table(&table).unwrap();
            mutator
                .upsert_record(&table, &key, BlobId::new(repo.blob(payload).unwrap()))
                .unwrap();
            commit_tree(&repo, mutator.write().unwrap(), base, "write")
        };

        let ours = commit_with(b"one");
        let theirs = commit_with(b"two");

        assert_eq!(changed_paths(&repo, base, ours).unwrap(), vec![PathBuf::from("content/row1.json")]);
        assert_eq!(find_merge_base(&repo, ours, theirs).unwrap(), Some(base));
        assert_eq!(
            detect_conflicts(&repo, ours, theirs).unwrap(),
            vec![PathBuf::from("content/row1.json")]
        );
    }

    #[test]
    fn test_batch_message() {
        assert_eq!(
            CommitMessage::batch("add content", 3, 1, Some("tx001")),
            "[BATCH] add content (+3 -1) tx:tx001"
        );
        assert_eq!(CommitMessage::batch("seed", 1, 0, None), "[BATCH] seed (+1 -0)");
    }
}
