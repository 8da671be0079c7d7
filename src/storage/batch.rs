//! Write batches.
//!
//! A batch collects table and record mutations and is applied as a single
//! tree rewrite, so everything in it lands in exactly one commit.

use crate::storage::blob::Record;
use crate::storage::types::{RecordKey, TableName};

/// a single mutation inside a [`WriteBatch`]
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// create a table unless it already exists
    EnsureTable(TableName),
    /// insert or overwrite a record
    Put { table: TableName, record: Record },
    /// remove a record, failing if it is missing
    Delete { table: TableName, key: RecordKey },
}

/// an ordered set of mutations applied atomically
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    label: String,
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ops: Vec::new(),
        }
    }

    /// repeated calls for the same table collapse into one op
    pub fn ensure_table(&mut self, table: TableName) -> &mut Self {
        let already = self
            .ops
            .iter()
            .any(|op| matches!(op, BatchOp::EnsureTable(t) if *t == table));
        if !already {
            self.ops.push(BatchOp::EnsureTable(table));
        }
        self
    }

    pub fn put(&mut self, table: TableName, record: Record) -> &mut Self {
        self.ops.push(BatchOp::Put { table, record });
        self
    }

    pub fn delete(&mut self, table: TableName, key: RecordKey) -> &mut Self {
        self.ops.push(BatchOp::Delete { table, key });
        self
    }

    /// append every op of another batch
    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// number of record puts
    pub fn puts(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, BatchOp::Put { .. }))
            .count()
    }

    /// number of record deletes
    pub fn deletes(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, BatchOp::Delete { .. }))
            .count()
    }
}
