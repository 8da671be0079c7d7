//! Git-backed record storage.
//!
//! Records are JSON blobs under `{table}/{key}.json` in the commit tree.
//! [`GitStore`] applies a [`WriteBatch`] on top of any commit as one new
//! commit; moving `main` is left to the transaction layer, which is the only
//! caller of the branch operations. Nothing above this module touches git2.
//!
//! ```ignore
//! use contentdb::storage::{GitStore, Record, RecordKey, TableName, WriteBatch};
//!
//! let store = GitStore::open_or_init("./my_store")?;
//! let table = TableName::new("content")?;
//!
//! let mut batch = WriteBatch::new("seed");
//! batch
//!     .ensure_table(table.clone())
//!     .put(table.clone(), Record::encode(RecordKey::generate(), &unit)?);
//! let commit = store.apply_batch(&batch, store.head()?, None)?;
//!
//! let records = store.scan_table(&table, commit)?;
//! ```

mod batch;
mod blob;
mod commit;
mod error;
mod refs;
mod store;
mod tree;
mod types;

pub use batch::{BatchOp, WriteBatch};
pub use blob::Record;
pub use commit::{CommitInfo, CommitMessage};
pub use error::{StorageError, StorageResult};
pub use store::{GitStore, StoreStats};
pub use types::{BlobId, BranchName, CommitId, GitSignature, InvalidNameError, RecordKey, TableName, TreeId};

pub(crate) use refs::RefManager;
