//! Starting, publishing and retrying transactions.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use ulid::Ulid;

use crate::storage::{CommitId, GitStore};
use crate::transaction::context::{Transaction, TxActive};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;

/// Hands out transactions on one store and publishes them to `main` one
/// at a time. Clones share state.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

struct TransactionManagerInner {
    store: GitStore,
    isolation: IsolationLevel,
    /// ids of transactions begun here and not yet finished
    live: RwLock<HashSet<String>>,
    publish: Mutex<()>,
}

impl TransactionManager {
    pub fn new(store: GitStore) -> Self {
        Self::with_isolation(store, IsolationLevel::default())
    }

    pub fn with_isolation(store: GitStore, isolation: IsolationLevel) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                store,
                isolation,
                live: RwLock::new(HashSet::new()),
                publish: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &GitStore {
        &self.inner.store
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.isolation
    }

    pub fn head(&self) -> TransactionResult<CommitId> {
        Ok(self.inner.store.head()?)
    }

    pub fn begin(&self) -> TransactionResult<Transaction<TxActive>> {
        self.begin_with_isolation(self.inner.isolation)
    }

    /// Branch `tx/{ulid}` off the current `main`.
    pub fn begin_with_isolation(&self, isolation: IsolationLevel) -> TransactionResult<Transaction<TxActive>> {
        let tx_id = Ulid::new().to_string().to_lowercase();
        let base = self.inner.store.head()?;
        let branch = self.inner.store.create_transaction_branch(&tx_id, base)?;

        self.inner.live.write().insert(tx_id.clone());
        tracing::trace!(tx_id = %tx_id, base = %base.short(), %isolation, "transaction started");

        Ok(Transaction::new(self.inner.store.clone(), tx_id, branch, base, isolation))
    }

    pub fn active_count(&self) -> usize {
        self.inner.live.read().len()
    }

    pub fn is_active(&self, tx_id: &str) -> bool {
        self.inner.live.read().contains(tx_id)
    }

    fn finished(&self, tx_id: &str) {
        self.inner.live.write().remove(tx_id);
    }

    /// Publish `tx` to `main` and return the new tip.
    pub fn commit_transaction(&self, tx: Transaction<TxActive>) -> TransactionResult<CommitId> {
        let _publishing = self.inner.publish.lock();
        let tx_id = tx.id().to_string();
        let result = tx.commit();
        self.finished(&tx_id);
        Ok(result?.final_commit())
    }

    pub fn rollback_transaction(&self, tx: Transaction<TxActive>) -> TransactionResult<()> {
        let tx_id = tx.id().to_string();
        let result = tx.rollback();
        self.finished(&tx_id);
        result.map(drop)
    }

    /// Delete `tx/` branches no live transaction owns, i.e. those left
    /// behind by a crashed process. Returns how many went.
    pub fn cleanup_abandoned(&self) -> TransactionResult<usize> {
        let live = self.inner.live.read().clone();
        let mut removed = 0;
        for branch in self.inner.store.list_transaction_branches()? {
            let Some(tx_id) = branch.transaction_id() else { continue };
            if live.contains(tx_id) {
                continue;
            }
            match self.inner.store.delete_transaction_branch(tx_id) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(tx_id, error = %e, "could not remove abandoned transaction branch"),
            }
        }

        if removed > 0 {
            tracing::info!(removed, "removed abandoned transaction branches");
        }
        Ok(removed)
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
    pub fn with_transaction<F, T>(&self, f: F) -> TransactionResult<T>
    where
        F: FnOnce(&mut Transaction<TxActive>) -> TransactionResult<T>,
    {
        self.with_transaction_isolation(self.inner.isolation, f)
    }

    /// [`with_transaction`](Self::with_transaction) for callers with their own error type.
    pub fn with_transaction_isolation<F, T, E>(&self, isolation: IsolationLevel, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<TxActive>) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let mut tx = self.begin_with_isolation(isolation)?;

        match f(&mut tx) {
            Ok(value) => {
                self.commit_transaction(tx)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback_transaction(tx) {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run `f` in a fresh transaction, again while it fails with an error
    /// `retryable` accepts, for at most `max_attempts` runs.
    ///
    /// `f` may run several times, so it must not have effects outside the
    /// transaction.
    pub fn with_retries<F, T, E>(&self, max_attempts: u32, retryable: fn(&E) -> bool, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut Transaction<TxActive>) -> Result<T, E>,
        E: From<TransactionError> + std::fmt::Display,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.with_transaction_isolation(self.inner.isolation, &mut f) {
                Err(e) if attempt < max_attempts && retryable(&e) => {
                    tracing::debug!(attempt, error = %e, "retrying transaction");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("isolation", &self.inner.isolation)
            .field("live", &self.active_count())
            .finish()
    }
}
