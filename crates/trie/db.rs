use crate::error::TrieError;
use ethereum_types::H256;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// Backing key-value store for trie nodes, keyed by node hash.
///
/// `update_batch` is the persistence boundary: implementations must apply a
/// whole batch atomically, treating a `None` value as a deletion.
pub trait TrieDB: Send + Sync {
    fn get(&self, key: H256) -> Result<Option<Vec<u8>>, TrieError>;
    fn update_batch(&self, key_values: Vec<(H256, Option<Vec<u8>>)>) -> Result<(), TrieError>;
    fn keys(&self) -> Result<Vec<H256>, TrieError>;
    fn put(&self, key: H256, value: Vec<u8>) -> Result<(), TrieError> {
        self.update_batch(vec![(key, Some(value))])
    }
    fn delete(&self, key: H256) -> Result<(), TrieError> {
        self.update_batch(vec![(key, None)])
    }
    // Lifecycle hooks for stores backed by external resources
    fn init(&self) -> Result<(), TrieError> {
        Ok(())
    }
    fn close(&self) -> Result<(), TrieError> {
        Ok(())
    }
    fn is_alive(&self) -> bool {
        true
    }
}

/// InMemory implementation for the TrieDB trait, with get and put operations.
#[derive(Clone)]
pub struct InMemoryTrieDB {
    inner: Arc<Mutex<BTreeMap<H256, Vec<u8>>>>,
}

impl InMemoryTrieDB {
    pub const fn new(map: Arc<Mutex<BTreeMap<H256, Vec<u8>>>>) -> Self {
        Self { inner: map }
    }

    pub fn new_empty() -> Self {
        Self {
            inner: Default::default(),
        }
    }

    /// Returns a handle to the shared map backing this store
    pub fn inner(&self) -> Arc<Mutex<BTreeMap<H256, Vec<u8>>>> {
        self.inner.clone()
    }
}

impl TrieDB for InMemoryTrieDB {
    fn get(&self, key: H256) -> Result<Option<Vec<u8>>, TrieError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .get(&key)
            .cloned())
    }

    fn update_batch(&self, key_values: Vec<(H256, Option<Vec<u8>>)>) -> Result<(), TrieError> {
        let mut db = self.inner.lock().map_err(|_| TrieError::LockError)?;

        for (key, value) in key_values {
            match value {
                Some(value) => {
                    db.insert(key, value);
                }
                None => {
                    db.remove(&key);
                }
            }
        }

        Ok(())
    }

    fn keys(&self) -> Result<Vec<H256>, TrieError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .keys()
            .copied()
            .collect())
    }
}
