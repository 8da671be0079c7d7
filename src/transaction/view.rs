//! Read access shared by snapshots and open transactions.
//!
//! The version engine reads through [`ReadView`] so the same query code runs
//! against a fixed commit on main or against a transaction that must see its
//! own uncommitted writes.

use crate::storage::{CommitId, GitStore, Record, RecordKey, TableName};
use crate::transaction::context::{Transaction, TxActive};
use crate::transaction::error::{TransactionError, TransactionResult};

/// Something records can be read from.
pub trait ReadView {
    /// Read one record. `None` if the table or the record is missing.
    fn read(&self, table: &TableName, key: &RecordKey) -> TransactionResult<Option<Record>>;

    /// Read every record of a table. A missing table reads as empty.
    fn scan(&self, table: &TableName) -> TransactionResult<Vec<Record>>;
}

/// A read-only view of the store at one commit.
#[derive(Debug, Clone)]
pub struct Snapshot {
    store: GitStore,
    commit: CommitId,
}

impl Snapshot {
    pub fn at(store: GitStore, commit: CommitId) -> Self {
        Self { store, commit }
    }

    /// Snapshot of the current tip of main.
    pub fn head(store: GitStore) -> TransactionResult<Self> {
        let commit = store.head()?;
        Ok(Self { store, commit })
    }

    pub fn commit(&self) -> CommitId {
        self.commit
    }
}

impl ReadView for Snapshot {
    fn read(&self, table: &TableName, key: &RecordKey) -> TransactionResult<Option<Record>> {
        self.store
            .read_record(table, key, self.commit)
            .map_err(TransactionError::from)
    }

    fn scan(&self, table: &TableName) -> TransactionResult<Vec<Record>> {
        self.store.scan_table(table, self.commit).map_err(TransactionError::from)
    }
}

impl ReadView for Transaction<TxActive> {
    fn read(&self, table: &TableName, key: &RecordKey) -> TransactionResult<Option<Record>> {
        Transaction::read(self, table, key)
    }

    fn scan(&self, table: &TableName) -> TransactionResult<Vec<Record>> {
        Transaction::scan(self, table)
    }
}

impl<V: ReadView + ?Sized> ReadView for &V {
    fn read(&self, table: &TableName, key: &RecordKey) -> TransactionResult<Option<Record>> {
        (**self).read(table, key)
    }

    fn scan(&self, table: &TableName) -> TransactionResult<Vec<Record>> {
        (**self).scan(table)
    }
}

impl<V: ReadView + ?Sized> ReadView for &mut V {
    fn read(&self, table: &TableName, key: &RecordKey) -> TransactionResult<Option<Record>> {
        (**self).read(table, key)
    }

    fn scan(&self, table: &TableName) -> TransactionResult<Vec<Record>> {
        (**self).scan(table)
    }
}
