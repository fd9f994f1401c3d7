//! In-memory stores backing the application-facing caches.

mod connkeymap;
mod keycache;

use std::sync::Arc;
use std::time::Duration;

pub(crate) use connkeymap::ConnKeyMap;
pub(crate) use keycache::{CacheEntry, KeyCache};

use crate::slot::SlotIndex;

/// The strings store: the keyed LRU plus its secondary indexes, kept
/// consistent by routing every insert and delete through this facade.
///
/// The LRU's removal hook cleans the indexes on eviction and lazy
/// expiry, so a key present in the LRU is always present in the slot
/// index (when one is in use) and vice versa.
pub(crate) struct StringsStore {
    keys: KeyCache,
    conns: Arc<ConnKeyMap>,
    slots: Option<Arc<SlotIndex>>,
}

impl StringsStore {
    pub(crate) fn new(capacity: usize, track_slots: bool) -> StringsStore {
        let conns = Arc::new(ConnKeyMap::new());
        let slots = track_slots.then(|| Arc::new(SlotIndex::new()));
        let hook = {
            let conns = Arc::clone(&conns);
            let slots = slots.clone();
            Box::new(move |key: &str, entry: &CacheEntry| {
                conns.del(entry.conn_id, key);
                if let Some(slots) = &slots {
                    slots.remove(key);
                }
            })
        };
        StringsStore {
            keys: KeyCache::new(capacity, Some(hook)),
            conns,
            slots,
        }
    }

    pub(crate) fn set_ex(&self, key: &str, val: &[u8], conn_id: i64, ttl: Duration) {
        self.keys.set_ex(key, val, conn_id, ttl);
        self.conns.add(conn_id, key);
        if let Some(slots) = &self.slots {
            slots.add(key);
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.keys.get(key)
    }

    pub(crate) fn del(&self, key: &str) {
        self.keys.del(key);
    }

    /// Full reset, used when invalidation coverage may have lapsed.
    pub(crate) fn purge(&self) {
        self.keys.purge_all();
        self.conns.clear();
        if let Some(slots) = &self.slots {
            slots.clear();
        }
    }

    /// Drops every entry fetched over the given connection.
    pub(crate) fn purge_conn(&self, conn_id: i64) {
        for key in self.conns.take_keys(conn_id) {
            self.keys.del(&key);
        }
    }

    /// Drops every entry whose key hashes to `slot`.
    pub(crate) fn purge_slot(&self, slot: u16) {
        let Some(slots) = &self.slots else {
            return;
        };
        for key in slots.remove_slot(slot) {
            self.keys.del(&key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}
