//! Transactions over the Git store.
//!
//! A transaction writes on its own `tx/{ulid}` branch and is published by
//! fast-forwarding `main` to it. Only one publish runs at a time; a
//! transaction that finds `main` moved fails with a retryable error and is
//! run again from scratch by [`TransactionManager::with_retries`].
//!
//! ```ignore
//! use contentdb::transaction::{TransactionError, TransactionManager};
//!
//! let manager = TransactionManager::new(store);
//! manager.with_retries(3, TransactionError::is_retryable, |tx| {
//!     let current = tx.read(&table, &key)?;
//!     tx.apply(&batch)
//! })?;
//! ```

mod context;
mod error;
mod isolation;
mod manager;
mod view;

pub use context::{Transaction, TxAborted, TxActive, TxCommitted};
pub use error::{TransactionError, TransactionResult};
pub use isolation::IsolationLevel;
pub use manager::TransactionManager;
pub use view::{ReadView, Snapshot};
