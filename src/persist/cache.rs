use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::persist::store::BackingStore;

/// Store key holding the version stamp.
pub const VERSION_KEY: &str = "__computed_flow_version";

/// Cache settings, loadable from configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedCacheOptions {
    /// Version stamp. Opening a store stamped with another version clears it.
    pub version: String,
    /// Delay between the first buffered write and the flush that commits it.
    pub flush_delay_ms: u64,
}

impl Default for PersistedCacheOptions {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            flush_delay_ms: 100,
        }
    }
}

impl PersistedCacheOptions {
    /// The flush debounce delay.
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Value record as written to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    value: Vec<u8>,
    /// Unix time in milliseconds.
    expires_at: Option<u64>,
}

impl StoredEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Set(StoredEntry),
    Remove,
}

type Batch = ahash::HashMap<String, Slot>;

#[derive(Default)]
struct Buffers {
    pending: Batch,
    flushing: Arc<Batch>,
}

struct CacheInner {
    store: Arc<dyn BackingStore>,
    options: PersistedCacheOptions,
    buffers: Mutex<Buffers>,
    flush_lock: tokio::sync::Mutex<()>,
    flush_scheduled: AtomicBool,
}

/// Write-back cache over a [`BackingStore`].
///
/// Writes land in a pending buffer and are committed by a debounced flush. Reads
/// see the pending buffer first, then the batch being flushed, then the store.
/// Store failures are logged and read as misses. Cheap to clone.
#[derive(Clone)]
pub struct PersistedCache {
    inner: Arc<CacheInner>,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

impl PersistedCache {
    /// Open a cache over `store`.
    ///
    /// If the store's version stamp differs from `options.version`, or is missing,
    /// the store is cleared and re-stamped before anything else touches it.
    pub async fn open(
        store: Arc<dyn BackingStore>,
        options: PersistedCacheOptions,
    ) -> Result<Self, StoreError> {
        let stamped = store.load(VERSION_KEY).await?;
        if stamped.as_deref() != Some(options.version.as_bytes()) {
            tracing::info!(
                found = ?stamped.as_deref().map(String::from_utf8_lossy),
                version = %options.version,
                "persisted cache version changed, clearing store"
            );
            store.clear().await?;
            store
                .save(VERSION_KEY, options.version.as_bytes().to_vec())
                .await?;
        }
        Ok(Self {
            inner: Arc::new(CacheInner {
                store,
                options,
                buffers: Mutex::new(Buffers::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                flush_scheduled: AtomicBool::new(false),
            }),
        })
    }

    /// The options the cache was opened with.
    pub fn options(&self) -> &PersistedCacheOptions {
        &self.inner.options
    }

    /// Read the value stored under `key`. Expired and unreadable entries are misses.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let buffered = {
            let buffers = self.inner.buffers.lock();
            buffers
                .pending
                .get(key)
                .or_else(|| buffers.flushing.get(key))
                .cloned()
        };
        let entry = match buffered {
            Some(Slot::Set(entry)) => entry,
            Some(Slot::Remove) => return None,
            None => self.load(key).await?,
        };
        if entry.is_expired(unix_millis()) {
            self.remove(key);
            return None;
        }
        Some(entry.value)
    }

    async fn load(&self, key: &str) -> Option<StoredEntry> {
        let bytes = match self.inner.store.load(key).await {
            Ok(bytes) => bytes?,
            Err(err) => {
                tracing::warn!(key, error = %err, "persisted cache read failed");
                return None;
            }
        };
        match bincode::deserialize(&bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(key, error = %err, "persisted cache record is corrupt");
                None
            }
        }
    }

    /// Store `value` under `key`.
    pub fn set(&self, key: impl Into<String>, value: Vec<u8>) {
        self.buffer(
            key.into(),
            Slot::Set(StoredEntry {
                value,
                expires_at: None,
            }),
        );
    }

    /// Store `value` under `key`, reading as a miss once `ttl` has passed.
    pub fn set_with_expiry(&self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) {
        let expires_at = unix_millis().saturating_add(ttl.as_millis() as u64);
        self.buffer(
            key.into(),
            Slot::Set(StoredEntry {
                value,
                expires_at: Some(expires_at),
            }),
        );
    }

    /// Remove the value stored under `key`.
    pub fn remove(&self, key: &str) {
        self.buffer(key.to_string(), Slot::Remove);
    }

    /// Number of writes waiting for the next flush.
    pub fn pending_writes(&self) -> usize {
        self.inner.buffers.lock().pending.len()
    }

    fn buffer(&self, key: String, slot: Slot) {
        self.inner.buffers.lock().pending.insert(key, slot);
        self.schedule_flush();
    }

    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.flush_scheduled.store(false, Ordering::SeqCst);
            tracing::warn!("no tokio runtime, persisted cache writes stay buffered until flush()");
            return;
        };
        let cache = self.clone();
        let delay = self.inner.options.flush_delay();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            cache.inner.flush_scheduled.store(false, Ordering::SeqCst);
            cache.flush().await;
        });
    }

    /// Commit every buffered write now and wait for it to finish.
    ///
    /// Flushes never overlap: a flush waits for the previous one to complete.
    pub async fn flush(&self) {
        let _serial = self.inner.flush_lock.lock().await;
        let batch = {
            let mut buffers = self.inner.buffers.lock();
            if buffers.pending.is_empty() {
                return;
            }
            let batch = Arc::new(std::mem::take(&mut buffers.pending));
            buffers.flushing = batch.clone();
            batch
        };

        let store = &self.inner.store;
        let mut failed = 0;
        for (key, slot) in batch.iter() {
            let result = match slot {
                Slot::Set(entry) => match bincode::serialize(entry) {
                    Ok(bytes) => store.save(key, bytes).await,
                    Err(err) => Err(StoreError::from(err)),
                },
                Slot::Remove => store.delete(key).await,
            };
            if let Err(err) = result {
                failed += 1;
                tracing::warn!(key, error = %err, "persisted cache write failed");
            }
        }

        self.inner.buffers.lock().flushing = Arc::default();
        tracing::debug!(entries = batch.len(), failed, "persisted cache flushed");
    }

    /// Remove every value, buffered or stored. The version stamp is kept.
    pub async fn clear(&self) {
        let _serial = self.inner.flush_lock.lock().await;
        {
            let mut buffers = self.inner.buffers.lock();
            buffers.pending.clear();
            buffers.flushing = Arc::default();
        }
        let store = &self.inner.store;
        if let Err(err) = store.clear().await {
            tracing::warn!(error = %err, "persisted cache clear failed");
            return;
        }
        if let Err(err) = store
            .save(VERSION_KEY, self.inner.options.version.as_bytes().to_vec())
            .await
        {
            tracing::warn!(error = %err, "failed to restamp persisted cache version");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::store::MemoryStore;

    async fn open(store: &Arc<MemoryStore>, version: &str) -> PersistedCache {
        PersistedCache::open(
            store.clone(),
            PersistedCacheOptions {
                version: version.to_string(),
                flush_delay_ms: 50,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_reads_see_pending_writes() {
        let store = Arc::new(MemoryStore::new());
        let cache = open(&store, "1").await;
        cache.set("a", vec![1, 2, 3]);
        assert_eq!(cache.get("a").await, Some(vec![1, 2, 3]));
        assert!(!store.contains("a"));

        cache.flush().await;
        assert!(store.contains("a"));
        assert_eq!(cache.pending_writes(), 0);
        assert_eq!(cache.get("a").await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_remove_shadows_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = open(&store, "1").await;
        cache.set("a", vec![1]);
        cache.flush().await;

        cache.remove("a");
        assert_eq!(cache.get("a").await, None);
        cache.flush().await;
        assert!(!store.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_flush_batches_writes() {
        let store = Arc::new(MemoryStore::new());
        let cache = open(&store, "1").await;
        let stamp_writes = store.writes();

        for i in 0..10u8 {
            cache.set(format!("k{}", i), vec![i]);
        }
        cache.set("k0", vec![42]);
        assert_eq!(store.writes(), stamp_writes);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // One write per distinct key.
        assert_eq!(store.writes(), stamp_writes + 10);
        assert_eq!(cache.get("k0").await, Some(vec![42]));
    }

    #[tokio::test]
    async fn test_version_gate_clears_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = open(&store, "1").await;
        cache.set("a", vec![1]);
        cache.flush().await;

        let reopened = open(&store, "1").await;
        assert_eq!(reopened.get("a").await, Some(vec![1]));

        let migrated = open(&store, "2").await;
        assert_eq!(migrated.get("a").await, None);
        assert!(store.contains(VERSION_KEY));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = open(&store, "1").await;
        cache.set_with_expiry("short", vec![1], Duration::ZERO);
        cache.set_with_expiry("long", vec![2], Duration::from_secs(3600));
        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.get("long").await, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_store_failures_are_misses() {
        let store = Arc::new(MemoryStore::new());
        let cache = open(&store, "1").await;
        cache.set("a", vec![1]);

        store.set_failing(true);
        cache.flush().await;
        assert_eq!(cache.get("a").await, None);

        store.set_failing(false);
        assert_eq!(cache.get("a").await, None);
        cache.set("a", vec![2]);
        cache.flush().await;
        assert_eq!(cache.get("a").await, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_clear() {
        let store = Arc::new(MemoryStore::new());
        let cache = open(&store, "1").await;
        cache.set("a", vec![1]);
        cache.flush().await;
        cache.set("b", vec![2]);

        cache.clear().await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, None);
        assert!(store.contains(VERSION_KEY));
    }
}
