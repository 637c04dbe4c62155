//! In-memory store used by the tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{BardError, Result};

use super::{DurableStore, TxnLatch};

/// A [`DurableStore`] backed by a map; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemStore {
    tables: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    txn: TxnLatch,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemStore {
    fn begin_transaction(&self) {
        self.txn.acquire();
    }

    fn end_transaction(&self) {
        self.txn.release();
    }

    fn add(&self, table: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(table.to_string()).or_default();
        if table.contains_key(key) {
            return Err(BardError::StoreKeyExists(key.to_string()));
        }
        table.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn update(&self, table: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(table.to_string()).or_default();
        match table.get_mut(key) {
            Some(slot) => {
                *slot = value.to_vec();
                Ok(())
            }
            None => Err(BardError::StoreKeyNotFound(key.to_string())),
        }
    }

    fn del(&self, table: &str, key: &str) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        Ok(tables
            .get_mut(table)
            .is_some_and(|t| t.remove(key).is_some()))
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn keys(&self, table: &str) -> Result<Vec<String>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_update_del_semantics() {
        let store = MemStore::new();
        store.begin_transaction();
        store.add("t", "k", b"v1").unwrap();
        assert!(store.add("t", "k", b"v2").is_err());
        store.update("t", "k", b"v2").unwrap();
        store.end_transaction();

        assert_eq!(store.get("t", "k").unwrap().as_deref(), Some(&b"v2"[..]));
        assert!(store.update("t", "missing", b"x").is_err());
        assert!(store.del("t", "k").unwrap());
        assert!(!store.del("t", "k").unwrap());
    }
}
