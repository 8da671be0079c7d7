//! Branches.
//!
//! `main` is the published state of the store. Every transaction writes on
//! its own `tx/{id}` branch, so a crashed writer leaves a branch behind that
//! a later startup can find and remove.

use git2::{BranchType, ErrorCode, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BranchName, CommitId};

pub struct RefManager;

impl RefManager {
    pub fn resolve_branch(repo: &Repository, branch: &BranchName) -> StorageResult<CommitId> {
        repo.find_reference(&branch.as_ref_path())
            .and_then(|reference| reference.peel_to_commit())
            .map(|commit| CommitId::new(commit.id()))
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))
    }

    /// Commit `HEAD` (that is, `main`) points at.
    pub fn head_commit(repo: &Repository) -> StorageResult<CommitId> {
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Err(StorageError::EmptyRepository),
            Err(e) => return Err(e.into()),
        };
        Ok(CommitId::new(head.peel_to_commit()?.id()))
    }

    pub fn branch_exists(repo: &Repository, branch: &BranchName) -> bool {
        repo.find_reference(&branch.as_ref_path()).is_ok()
    }

    pub fn create_branch(repo: &Repository, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        if Self::branch_exists(repo, branch) {
            return Err(StorageError::BranchAlreadyExists(branch.to_string()));
        }
        repo.branch(branch.as_str(), &repo.find_commit(target.raw())?, false)?;
        Ok(())
    }

    /// Point an existing branch at `target`, whatever it pointed at before.
    pub fn update_branch(repo: &Repository, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        let mut reference = repo
            .find_reference(&branch.as_ref_path())
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;
        reference.set_target(target.raw(), &format!("move to {}", target.short()))?;
        Ok(())
    }

    /// Compare-and-swap: move `branch` to `target` only while it still
    /// points at `expected`.
    pub fn update_branch_if_unchanged(
        repo: &Repository,
        branch: &BranchName,
        expected: CommitId,
        target: CommitId,
    ) -> StorageResult<()> {
        let moved = || StorageError::ConcurrentModification {
            branch: branch.to_string(),
        };

        if Self::resolve_branch(repo, branch)? != expected {
            return Err(moved());
        }

        let message = format!("fast-forward {} to {}", branch, target.short());
        match repo.reference_matching(&branch.as_ref_path(), target.raw(), true, expected.raw(), &message) {
            Ok(_) => Ok(()),
            Err(e) if e.code() == ErrorCode::Modified => Err(moved()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_branch(repo: &Repository, branch: &BranchName) -> StorageResult<()> {
        repo.find_branch(branch.as_str(), BranchType::Local)
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?
            .delete()?;
        Ok(())
    }

    /// Every `tx/` branch, i.e. every transaction still open or left by a crash.
    pub fn list_transaction_branches(repo: &Repository) -> StorageResult<Vec<BranchName>> {
        let mut branches = Vec::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            let Some(name) = branch.name()? else { continue };
            if name.starts_with(BranchName::TX_PREFIX) {
                if let Ok(name) = BranchName::new(name) {
                    branches.push(name);
                }
            }
        }
        Ok(branches)
    }

    pub fn create_transaction_branch(repo: &Repository, tx_id: &str, base: CommitId) -> StorageResult<BranchName> {
        let branch = BranchName::for_transaction(tx_id);
        Self::create_branch(repo, &branch, base)?;
        Ok(branch)
    }

    pub fn delete_transaction_branch(repo: &Repository, tx_id: &str) -> StorageResult<()> {
        Self::delete_branch(repo, &BranchName::for_transaction(tx_id))
    }

    /// Create `main` at the root commit unless present, and make it `HEAD`.
    pub fn init_main_branch(repo: &Repository, root: CommitId) -> StorageResult<()> {
        let main = BranchName::main();
        if !Self::branch_exists(repo, &main) {
            Self::create_branch(repo, &main, root)?;
        }
        repo.set_head(&main.as_ref_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::create_initial_tree;
    use tempfile::TempDir;

    fn commit_on(repo: &Repository, parent: Option<CommitId>, update_ref: Option<&str>) -> CommitId {
        let tree = repo.find_tree(create_initial_tree(repo).unwrap().raw()).unwrap();
        let sig = git2::Signature::now("test", "test@localhost").unwrap();
        let parent = parent.map(|id| repo.find_commit(id.raw()).unwrap());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        CommitId::new(repo.commit(update_ref, &sig, &sig, "commit", &tree, &parents).unwrap())
    }

    fn setup() -> (TempDir, Repository, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let root = commit_on(&repo, None, Some("HEAD"));
        // HEAD may already have created the default branch
        let _ = RefManager::init_main_branch(&repo, root);
        (dir, repo, root)
    }

    #[test]
    fn test_head_follows_main() {
        let (_dir, repo, root) = setup();
        assert_eq!(RefManager::head_commit(&repo).unwrap(), root);
        assert_eq!(RefManager::resolve_branch(&repo, &BranchName::main()).unwrap(), root);
    }

    #[test]
    fn test_transaction_branch_lifecycle() {
        let (_dir, repo, root) = setup();

        let first = RefManager::create_transaction_branch(&repo, "tx001", root).unwrap();
        RefManager::create_transaction_branch(&repo, "tx002", root).unwrap();
        assert_eq!(first.transaction_id(), Some("tx001"));
        assert!(RefManager::branch_exists(&repo, &first));
        assert_eq!(RefManager::list_transaction_branches(&repo).unwrap().len(), 2);

        let again = RefManager::create_transaction_branch(&repo, "tx001", root);
        assert!(matches!(again, Err(StorageError::BranchAlreadyExists(_))));

        RefManager::delete_transaction_branch(&repo, "tx001").unwrap();
        let remaining = RefManager::list_transaction_branches(&repo).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].transaction_id(), Some("tx002"));
    }

    #[test]
    fn test_missing_branch() {
        let (_dir, repo, _) = setup();
        let result = RefManager::delete_transaction_branch(&repo, "nope");
        assert!(matches!(result, Err(StorageError::RefNotFound(_))));
    }

    #[test]
    fn test_update_branch_if_unchanged() {
        let (_dir, repo, root) = setup();
        let branch = RefManager::create_transaction_branch(&repo, "tx001", root).unwrap();
        let next = commit_on(&repo, Some(root), None);

        RefManager::update_branch_if_unchanged(&repo, &branch, root, next).unwrap();
        assert_eq!(RefManager::resolve_branch(&repo, &branch).unwrap(), next);

        let result = RefManager::update_branch_if_unchanged(&repo, &branch, root, next);
        assert!(matches!(result, Err(StorageError::ConcurrentModification { .. })));
    }
}
