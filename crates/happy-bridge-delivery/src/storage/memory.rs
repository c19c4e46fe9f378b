//! In-memory transactional store.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde_json::Value;

use super::{Transaction, TransactionalStore, TxError};

/// A deleted row stays behind as a tombstone (`value: None`) so its
/// version never goes back to 0.
#[derive(Debug, Clone)]
struct Row {
    value: Option<Value>,
    version: u64,
}

#[derive(Debug, Default)]
struct Rows {
    clock: u64,
    rows: HashMap<String, Row>,
}

impl Rows {
    fn version_of(&self, key: &str) -> u64 {
        self.rows.get(key).map_or(0, |row| row.version)
    }

    fn value_of(&self, key: &str) -> Option<Value> {
        self.rows.get(key).and_then(|row| row.value.clone())
    }

    fn write(&mut self, key: &str, value: Option<Value>) {
        self.clock += 1;
        self.rows.insert(
            key.to_string(),
            Row {
                value,
                version: self.clock,
            },
        );
    }
}

/// In-memory storage with optimistic row versions.
///
/// Useful for development and tests. Data is lost on restart. A commit
/// fails with [`TxError::Conflict`] if any row the transaction read has been
/// written since.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Arc<RwLock<Rows>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value of `key`.
    #[must_use]
    pub fn read(&self, key: &str) -> Option<Value> {
        self.rows
            .read()
            .ok()
            .and_then(|rows| rows.value_of(key))
    }

    /// Write `key` outside any transaction.
    pub fn write(&self, key: &str, value: Value) {
        if let Ok(mut rows) = self.rows.write() {
            rows.write(key, Some(value));
        }
    }

    /// Number of committed rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows
            .read()
            .map_or(0, |rows| rows.rows.values().filter(|row| row.value.is_some()).count())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTx {
    rows: Arc<RwLock<Rows>>,
    reads: HashMap<String, u64>,
    writes: HashMap<String, Option<Value>>,
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, TxError> {
        if let Some(written) = self.writes.get(key) {
            return Ok(written.clone());
        }
        let rows = self
            .rows
            .read()
            .map_err(|e| TxError::Internal(e.to_string()))?;
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| rows.version_of(key));
        Ok(rows.value_of(key))
    }

    async fn put(&mut self, key: &str, value: Value) -> Result<(), TxError> {
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), TxError> {
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    async fn commit(self) -> Result<(), TxError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|e| TxError::Internal(e.to_string()))?;
        if self
            .reads
            .iter()
            .any(|(key, version)| rows.version_of(key) != *version)
        {
            return Err(TxError::Conflict);
        }
        for (key, value) in self.writes {
            rows.write(&key, value);
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, TxError> {
        Ok(MemoryTx {
            rows: self.rows.clone(),
            reads: HashMap::new(),
            writes: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_read_your_writes_and_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put("a", json!(1)).await.unwrap();
        assert_eq!(tx.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(store.read("a"), None);
        tx.commit().await.unwrap();
        assert_eq!(store.read("a"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_stale_read_conflicts() {
        let store = MemoryStore::new();
        store.write("seq", json!(1));

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.get("seq").await.unwrap();
        second.get("seq").await.unwrap();
        first.put("seq", json!(2)).await.unwrap();
        second.put("seq", json!(2)).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(TxError::Conflict)));
    }

    #[tokio::test]
    async fn test_reading_absent_key_conflicts_with_insert() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get("k").await.unwrap(), None);
        store.write("k", json!("other"));
        tx.put("k", json!("mine")).await.unwrap();
        assert!(matches!(tx.commit().await, Err(TxError::Conflict)));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.write("k", json!(1));
        let mut tx = store.begin().await.unwrap();
        tx.delete("k").await.unwrap();
        assert_eq!(tx.get("k").await.unwrap(), None);
        tx.commit().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_insert_then_delete_still_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get("k").await.unwrap(), None);

        store.write("k", json!("other"));
        let mut remover = store.begin().await.unwrap();
        remover.get("k").await.unwrap();
        remover.delete("k").await.unwrap();
        remover.commit().await.unwrap();
        assert_eq!(store.read("k"), None);

        tx.put("k", json!("mine")).await.unwrap();
        assert!(matches!(tx.commit().await, Err(TxError::Conflict)));
    }
}
