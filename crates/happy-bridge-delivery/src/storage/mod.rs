//! Transactional key-value storage and the `in_tx` runner.
//!
//! The relay's persistence is treated as an opaque serializable KV store.
//! [`in_tx`] runs a closure inside a transaction, retries the whole closure
//! on serialization conflicts and runs after-commit hooks once the commit
//! has succeeded.

#[cfg(feature = "memory")]
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

#[cfg(feature = "memory")]
pub use memory::{MemoryStore, MemoryTx};

/// Retries after the first attempt when a transaction conflicts.
pub const MAX_CONFLICT_RETRIES: u32 = 3;
const CONFLICT_BACKOFF_STEP: Duration = Duration::from_millis(10);

/// Transaction error.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("Serialization conflict")]
    Conflict,
    #[error("Storage error: {0}")]
    Internal(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One open transaction.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, TxError>;
    async fn put(&mut self, key: &str, value: Value) -> Result<(), TxError>;
    async fn delete(&mut self, key: &str) -> Result<(), TxError>;

    /// Commit. Returns [`TxError::Conflict`] if a row read by this
    /// transaction changed since it was read.
    async fn commit(self) -> Result<(), TxError>;
}

/// A store that can open serializable transactions.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx, TxError>;
}

type AfterCommit = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Transaction handle given to [`in_tx`] closures.
pub struct TxContext<X> {
    tx: X,
    after_commit: Vec<AfterCommit>,
}

impl<X: Transaction> TxContext<X> {
    fn new(tx: X) -> Self {
        Self {
            tx,
            after_commit: Vec::new(),
        }
    }

    /// # Errors
    /// Returns error if the read fails.
    pub async fn get(&mut self, key: &str) -> Result<Option<Value>, TxError> {
        self.tx.get(key).await
    }

    /// # Errors
    /// Returns error if the write fails.
    pub async fn put(&mut self, key: &str, value: Value) -> Result<(), TxError> {
        self.tx.put(key, value).await
    }

    /// # Errors
    /// Returns error if the delete fails.
    pub async fn delete(&mut self, key: &str) -> Result<(), TxError> {
        self.tx.delete(key).await
    }

    /// Run `hook` after a successful commit. Hooks of an attempt that does
    /// not commit are dropped.
    pub fn after_commit<F>(&mut self, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        self.after_commit.push(Box::new(hook));
    }
}

/// Run `f` in a transaction.
///
/// On a serialization conflict the whole closure is run again, up to
/// [`MAX_CONFLICT_RETRIES`] times, waiting `attempt * 10ms` in between.
/// After-commit hooks run in registration order; a failing hook is logged
/// and does not affect the others or the result.
///
/// # Errors
/// Returns the closure's error, a storage error, or [`TxError::Conflict`]
/// once retries are exhausted.
pub async fn in_tx<S, T, F>(store: &S, mut f: F) -> Result<T, TxError>
where
    S: TransactionalStore,
    F: for<'c> FnMut(&'c mut TxContext<S::Tx>) -> BoxFuture<'c, Result<T, TxError>> + Send,
    T: Send,
{
    let mut attempt = 0;
    loop {
        let mut ctx = TxContext::new(store.begin().await?);
        let result = match f(&mut ctx).await {
            Ok(value) => {
                let TxContext { tx, after_commit } = ctx;
                tx.commit().await.map(|()| (value, after_commit))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((value, hooks)) => {
                for (index, hook) in hooks.into_iter().enumerate() {
                    if let Err(e) = hook().await {
                        tracing::error!(index, error = %e, "After-commit hook failed");
                    }
                }
                return Ok(value);
            }
            Err(TxError::Conflict) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, "Transaction conflict, retrying");
                tokio::time::sleep(CONFLICT_BACKOFF_STEP * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
