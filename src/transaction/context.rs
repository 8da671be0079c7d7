//! A single transaction, with its lifecycle tracked in the type.
//!
//! Only `Transaction<TxActive>` can read, write, commit or roll back;
//! both `commit` and `rollback` consume it. Every exit path removes the
//! transaction branch.

use std::marker::PhantomData;

use crate::storage::{BranchName, CommitId, GitStore, Record, RecordKey, StorageError, TableName, WriteBatch};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;

#[derive(Debug)]
pub struct TxActive;

#[derive(Debug)]
pub struct TxCommitted;

#[derive(Debug)]
pub struct TxAborted;

pub struct Transaction<State> {
    store: GitStore,
    tx_id: String,
    branch: BranchName,
    /// `main` when the transaction began
    base: CommitId,
    /// last commit on the transaction branch
    tip: CommitId,
    isolation: IsolationLevel,
    _state: PhantomData<State>,
}

impl<State> Transaction<State> {
    pub fn id(&self) -> &str {
        &self.tx_id
    }

    pub fn branch(&self) -> &BranchName {
        &self.branch
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn into_state<Next>(self) -> Transaction<Next> {
        Transaction {
            store: self.store,
            tx_id: self.tx_id,
            branch: self.branch,
            base: self.base,
            tip: self.tip,
            isolation: self.isolation,
            _state: PhantomData,
        }
    }
}

impl Transaction<TxActive> {
    pub(crate) fn new(
        store: GitStore,
        tx_id: String,
        branch: BranchName,
        base: CommitId,
        isolation: IsolationLevel,
    ) -> Self {
        Self {
            store,
            tx_id,
            branch,
            base,
            tip: base,
            isolation,
            _state: PhantomData,
        }
    }

    pub fn has_writes(&self) -> bool {
        self.tip != self.base
    }

    /// Commit reads are served from.
    ///
    /// After the first write that is always the transaction's own branch.
    /// Before it, read-committed transactions follow `main`.
    fn read_commit(&self) -> TransactionResult<CommitId> {
        if self.has_writes() || self.isolation.uses_snapshot() {
            Ok(self.tip)
        } else {
            Ok(self.store.head()?)
        }
    }

    /// Apply `batch` as one commit on the transaction branch.
    pub fn apply(&mut self, batch: &WriteBatch) -> TransactionResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let commit = self.store.apply_batch(batch, self.tip, Some(&self.tx_id))?;
        self.store.update_branch(&self.branch, commit)?;
        self.tip = commit;

        tracing::trace!(
            tx_id = %self.tx_id,
            label = batch.label(),
            ops = batch.len(),
            commit = %commit.short(),
            "applied batch"
        );
        Ok(())
    }

    pub fn read(&self, table: &TableName, key: &RecordKey) -> TransactionResult<Option<Record>> {
        let at = self.read_commit()?;
        Ok(self.store.read_record(table, key, at)?)
    }

    pub fn scan(&self, table: &TableName) -> TransactionResult<Vec<Record>> {
        let at = self.read_commit()?;
        Ok(self.store.scan_table(table, at)?)
    }

    fn discard_branch(&self) {
        if let Err(e) = self.store.delete_transaction_branch(&self.tx_id) {
            tracing::warn!(tx_id = %self.tx_id, error = %e, "failed to delete transaction branch");
        }
    }

    /// Fast-forward `main` to the transaction branch.
    ///
    /// A transaction that wrote nothing always succeeds. If `main` moved
    /// since `begin`, the commit fails with a retryable error: a conflict
    /// naming the records both sides wrote, or a serialization failure for
    /// snapshot transactions whose writes did not overlap.
    pub fn commit(mut self) -> TransactionResult<Transaction<TxCommitted>> {
        let main = match self.store.head() {
            Ok(head) => head,
            Err(e) => {
                self.discard_branch();
                return Err(e.into());
            }
        };

        if !self.has_writes() {
            self.discard_branch();
            self.tip = main;
            return Ok(self.into_state());
        }

        if main != self.base {
            let overlap = self.store.detect_conflicts(&self.branch, main);
            self.discard_branch();
            let overlap = overlap?;
            if overlap.is_empty() && self.isolation.uses_snapshot() {
                return Err(TransactionError::SerializationFailure);
            }
            return Err(TransactionError::conflict(overlap));
        }

        let published = self.store.fast_forward_main(&self.branch, self.base);
        self.discard_branch();
        match published {
            Ok(_) => {
                tracing::debug!(tx_id = %self.tx_id, commit = %self.tip.short(), "transaction committed");
                Ok(self.into_state())
            }
            // lost the swap to another writer after the check above
            Err(StorageError::ConcurrentModification { .. }) => Err(TransactionError::conflict(Vec::new())),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the transaction branch and everything written on it.
    pub fn rollback(self) -> TransactionResult<Transaction<TxAborted>> {
        self.discard_branch();
        tracing::debug!(tx_id = %self.tx_id, "transaction rolled back");
        Ok(self.into_state())
    }
}

impl Transaction<TxCommitted> {
    /// Where `main` pointed once this transaction was published.
    pub fn final_commit(&self) -> CommitId {
        self.tip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use serde_json::Value;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitStore) {
        let dir = TempDir::new().unwrap();
        let store = GitStore::init(dir.path()).unwrap();
        (dir, store)
    }

    fn begin(store: &GitStore, tx_id: &str, isolation: IsolationLevel) -> Transaction<TxActive> {
        let head = store.head().unwrap();
        let branch = store.create_transaction_branch(tx_id, head).unwrap();
        Transaction::new(store.clone(), tx_id.to_string(), branch, head, isolation)
    }

    fn put_batch(table: &TableName, key: &str, name: &str) -> WriteBatch {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), Value::String(name.to_string()));
        let mut batch = WriteBatch::new("put");
        batch
            .ensure_table(table.clone())
            .put(table.clone(), Record::new(RecordKey::new(key).unwrap(), data));
        batch
    }

    /// publish a write to main behind the transaction's back
    fn move_main(store: &GitStore, table: &TableName, key: &str) -> CommitId {
        let head = store.head().unwrap();
        let moved = store.apply_batch(&put_batch(table, key, "x"), head, None).unwrap();
        store.update_branch(&BranchName::main(), moved).unwrap();
        moved
    }

    #[test]
    fn test_apply_read_commit() {
        let (_dir, store) = setup();
        let table = TableName::new("repositories").unwrap();
        let key = RecordKey::new("r1").unwrap();

        let mut tx = begin(&store, "tx001", IsolationLevel::ReadCommitted);
        tx.apply(&put_batch(&table, "r1", "alpha")).unwrap();
        assert!(tx.has_writes());
        assert_eq!(
            tx.read(&table, &key).unwrap().unwrap().get("name"),
            Some(&Value::String("alpha".to_string()))
        );
        // not visible on main yet
        assert!(store.read_record(&table, &key, store.head().unwrap()).unwrap().is_none());

        let committed = tx.commit().unwrap();
        assert_eq!(store.head().unwrap(), committed.final_commit());
        assert!(store.read_record(&table, &key, store.head().unwrap()).unwrap().is_some());
        assert!(store.list_transaction_branches().unwrap().is_empty());
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (_dir, store) = setup();
        let initial = store.head().unwrap();
        let table = TableName::new("repositories").unwrap();

        let mut tx = begin(&store, "tx001", IsolationLevel::ReadCommitted);
        tx.apply(&put_batch(&table, "r1", "alpha")).unwrap();
        tx.rollback().unwrap();

        assert_eq!(store.head().unwrap(), initial);
        assert!(store.list_transaction_branches().unwrap().is_empty());
    }

    #[test]
    fn test_read_committed_sees_fresh_main_until_first_write() {
        let (_dir, store) = setup();
        let table = TableName::new("repositories").unwrap();
        let key = RecordKey::new("outside").unwrap();

        let mut tx = begin(&store, "tx001", IsolationLevel::ReadCommitted);
        move_main(&store, &table, "outside");
        assert!(tx.read(&table, &key).unwrap().is_some());

        // after a write, reads come from the transaction's own branch
        tx.apply(&put_batch(&table, "mine", "y")).unwrap();
        assert!(tx.read(&table, &key).unwrap().is_none());
        assert!(tx.read(&table, &RecordKey::new("mine").unwrap()).unwrap().is_some());

        assert!(matches!(tx.commit(), Err(TransactionError::Conflict { .. })));
        assert!(store.list_transaction_branches().unwrap().is_empty());
    }

    #[test]
    fn test_repeatable_read_is_pinned() {
        let (_dir, store) = setup();
        let table = TableName::new("repositories").unwrap();

        let mut tx = begin(&store, "tx001", IsolationLevel::RepeatableRead);
        move_main(&store, &table, "outside");
        assert!(tx.read(&table, &RecordKey::new("outside").unwrap()).unwrap().is_none());
        assert!(tx.scan(&table).unwrap().is_empty());

        tx.apply(&put_batch(&table, "mine", "y")).unwrap();
        assert!(matches!(tx.commit(), Err(TransactionError::SerializationFailure)));
    }

    #[test]
    fn test_overlapping_write_names_the_record() {
        let (_dir, store) = setup();
        let table = TableName::new("repositories").unwrap();

        let mut tx = begin(&store, "tx001", IsolationLevel::RepeatableRead);
        move_main(&store, &table, "shared");
        tx.apply(&put_batch(&table, "shared", "y")).unwrap();

        match tx.commit() {
            Err(TransactionError::Conflict { paths }) => {
                assert_eq!(paths, vec![std::path::PathBuf::from("repositories/shared.json")]);
            }
            other => panic!("expected conflict, got {:?}", other.map(|c| c.final_commit())),
        }
    }

    #[test]
    fn test_read_only_commit_after_main_moved() {
        let (_dir, store) = setup();
        let tx = begin(&store, "tx001", IsolationLevel::RepeatableRead);
        let moved = move_main(&store, &TableName::new("repositories").unwrap(), "outside");

        assert_eq!(tx.commit().unwrap().final_commit(), moved);
    }
}
