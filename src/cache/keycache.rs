use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// A cached scalar value with its expiry deadline and the client id of
/// the connection that fetched it.
pub(crate) struct CacheEntry {
    pub(crate) val: Vec<u8>,
    pub(crate) deadline: Instant,
    pub(crate) conn_id: i64,
}

/// Invoked whenever an entry leaves the cache through eviction, expiry
/// or deletion, so secondary indexes can clean themselves.
pub(crate) type EvictionHook = Box<dyn Fn(&str, &CacheEntry) + Send + Sync>;

/// Capacity-bounded key/value store with lazy expiry.
///
/// Thread-safe. Ordering between concurrent `set_ex` and `del` for the
/// same key is left to the higher-level protocol.
pub(crate) struct KeyCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
    on_removed: Option<EvictionHook>,
}

impl KeyCache {
    pub(crate) fn new(capacity: usize, on_removed: Option<EvictionHook>) -> KeyCache {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        KeyCache {
            inner: Mutex::new(LruCache::new(capacity)),
            on_removed,
        }
    }

    fn removed(&self, key: &str, entry: &CacheEntry) {
        if let Some(hook) = &self.on_removed {
            hook(key, entry);
        }
    }

    /// Inserts or overwrites; a displaced entry (same key or LRU victim)
    /// goes through the removal hook.
    pub(crate) fn set_ex(&self, key: &str, val: &[u8], conn_id: i64, ttl: Duration) {
        let entry = CacheEntry {
            val: val.to_vec(),
            deadline: Instant::now() + ttl,
            conn_id,
        };
        let displaced = self.inner.lock().unwrap().push(key.to_string(), entry);
        if let Some((old_key, old_entry)) = displaced {
            self.removed(&old_key, &old_entry);
        }
    }

    /// Returns the live value, removing the entry lazily when expired.
    pub(crate) fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(key) {
            None => return None,
            Some(entry) => {
                if Instant::now() <= entry.deadline {
                    return Some(entry.val.clone());
                }
            }
        }
        let expired = inner.pop_entry(key);
        drop(inner);
        if let Some((key, entry)) = expired {
            self.removed(&key, &entry);
        }
        None
    }

    /// Idempotent removal.
    pub(crate) fn del(&self, key: &str) {
        let popped = self.inner.lock().unwrap().pop_entry(key);
        if let Some((key, entry)) = popped {
            self.removed(&key, &entry);
        }
    }

    /// Drops everything without firing removal hooks; the caller resets
    /// secondary indexes wholesale.
    pub(crate) fn purge_all(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
