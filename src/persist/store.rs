//! Backing store contract.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Durable key-value storage behind a [`PersistedCache`](crate::persist::PersistedCache).
///
/// Writes need only be eventually visible; no transactional guarantee is expected.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Read the value stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Delete the value stored under `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete every value.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral hosting.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<ahash::HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns `true` if `key` is stored.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of successful `save` and `delete` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every operation fail with [`StoreError::Backend`] until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Backend("memory store is failing".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().clear();
        Ok(())
    }
}
